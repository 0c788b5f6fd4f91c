//! Scoring every KC of a turn in one call must match scoring them one by one.

use dialogkt_abstraction::{Dialogue, KcVocab, KtModel, ModelVariant, ObservedTurn, Turn, TurnContext};
use dialogkt_models::{ModelConfig, ModelFactory, ModelOptions};
use proptest::prelude::*;

const KCS: [&str; 4] = ["add fractions", "common denominator", "simplify", "word problems"];

fn training_dialogue() -> Dialogue {
    let turns = (0..8)
        .map(|i| Turn {
            speaker: if i % 2 == 0 { "tutor" } else { "student" }.to_string(),
            text: format!("turn {i} about {}", KCS[i % KCS.len()]),
            correct: (i % 2 == 1).then_some(i % 3 != 0),
            kcs: vec![KCS[i % KCS.len()].to_string(), KCS[(i + 1) % KCS.len()].to_string()],
        })
        .collect();
    Dialogue { id: "train".into(), subject: None, turns }
}

fn build(variant: ModelVariant, seed: u64) -> Box<dyn KtModel> {
    let factory = ModelFactory::new();
    let config = ModelConfig::from_options(variant, &ModelOptions::default()).unwrap();
    let mut model = factory.create(&config, &KcVocab::new(KCS), seed).unwrap();
    model.fit(&[training_dialogue()]).unwrap();
    model
}

fn context(evidence: &[Option<f64>]) -> TurnContext {
    let mut ctx = TurnContext::new("eval".into());
    for (i, e) in evidence.iter().enumerate() {
        ctx.history.push(ObservedTurn {
            speaker: "student".to_string(),
            text: format!("answer {i}"),
            kcs: vec![KCS[i % KCS.len()].to_string()],
            evidence: *e,
        });
    }
    ctx.turn_index = evidence.len();
    ctx
}

proptest! {
    #[test]
    fn packed_and_unpacked_predictions_agree(
        evidence in prop::collection::vec(prop::option::of(0.0_f64..=1.0), 0..6),
        seed in 0_u64..1000,
    ) {
        let ctx = context(&evidence);
        let kcs: Vec<String> = KCS.iter().map(|s| (*s).to_string()).collect();
        for variant in ModelVariant::ALL {
            let model = build(variant, seed);
            let packed = model.predict(&ctx, &kcs).unwrap();
            prop_assert_eq!(packed.len(), kcs.len());
            for (kc, p) in kcs.iter().zip(&packed) {
                let single = model.predict(&ctx, std::slice::from_ref(kc)).unwrap();
                prop_assert_eq!(single[0].to_bits(), p.to_bits(), "{} {}", variant, kc);
                prop_assert!((0.0..=1.0).contains(p));
            }
        }
    }
}
