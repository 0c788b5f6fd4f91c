use serde::{Deserialize, Serialize};
use std::sync::Mutex;

/// Lifecycle events of a training run, emitted per fold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    Started { fold: usize, epochs: usize },
    Epoch { fold: usize, epoch: usize, epochs: usize, train_loss: f64, validation_metric: Option<f64> },
    Message { fold: usize, message: String },
    FoldFinished { fold: usize, diverged: bool },
    Finished { fold: usize, best_epoch: Option<usize> },
}

pub trait ProgressSink: Send + Sync {
    fn on_event(&self, event: ProgressEvent);
}

#[derive(Debug, Default)]
pub struct StdoutProgressSink;

impl ProgressSink for StdoutProgressSink {
    fn on_event(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::Started { fold, epochs } => println!("[fold {fold}] started ({epochs} epochs)"),
            ProgressEvent::Epoch { fold, epoch, epochs, train_loss, validation_metric } => match validation_metric {
                Some(metric) => {
                    println!("[fold {fold}] epoch {epoch}/{epochs} loss {train_loss:.4} val {metric:.4}");
                }
                None => println!("[fold {fold}] epoch {epoch}/{epochs} loss {train_loss:.4}"),
            },
            ProgressEvent::Message { fold, message } => println!("[fold {fold}] {message}"),
            ProgressEvent::FoldFinished { fold, diverged } => {
                if diverged {
                    println!("[fold {fold}] diverged, excluded");
                } else {
                    println!("[fold {fold}] done");
                }
            }
            ProgressEvent::Finished { fold, best_epoch } => match best_epoch {
                Some(epoch) => println!("[fold {fold}] finished, best epoch {epoch}"),
                None => println!("[fold {fold}] finished"),
            },
        }
    }
}

/// Discards every event.
#[derive(Debug, Default)]
pub struct NullProgressSink;

impl ProgressSink for NullProgressSink {
    fn on_event(&self, _event: ProgressEvent) {}
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct RecordingProgressSink {
    events: Mutex<Vec<ProgressEvent>>,
}

impl RecordingProgressSink {
    #[must_use]
    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().map(|events| events.clone()).unwrap_or_default()
    }
}

impl ProgressSink for RecordingProgressSink {
    fn on_event(&self, event: ProgressEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}
