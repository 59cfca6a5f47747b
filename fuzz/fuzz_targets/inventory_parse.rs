#![no_main]

use cadence_runtime::{
    parse_inventory_document, CompletionConfig, CompletionDetector, CompletionSignals,
    InventorySignal, ProbeSignal,
};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let raw = String::from_utf8_lossy(data);
    let Ok(entities) = parse_inventory_document(&raw) else {
        return;
    };
    let detector = CompletionDetector::new(CompletionConfig::default());
    let verdict = detector.evaluate(&CompletionSignals {
        inventory: InventorySignal::Loaded(entities),
        dependency_probe: ProbeSignal::Unconfigured,
        build_probe: ProbeSignal::Unconfigured,
    });
    assert!((0.0..=1.0).contains(&verdict.score));
});
