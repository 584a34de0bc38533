#![cfg(not(target_arch = "wasm32"))]

use ember_hal::{
    attr, DeviceAttributes, DeviceConfig, HalCategory, HalError, HalRegistry, KernelAttributes,
};
use ember_snapshot::{Compression, Snapshot, StateSerializer};
use proptest::prelude::*;

proptest! {
    #[test]
    fn first_registration_wins(order in proptest::collection::vec(0u32..4, 1..32)) {
        let mut hal = HalRegistry::new();
        let mut first: [Option<i32>; 4] = [None; 4];
        for (i, cat) in order.iter().enumerate() {
            let lang = i as i32;
            let res = hal.register(HalCategory(*cat + 100), Box::new(Lang(HalCategory(*cat + 100), lang)));
            match first[*cat as usize] {
                None => {
                    prop_assert!(res.is_ok());
                    first[*cat as usize] = Some(lang);
                }
                Some(_) => prop_assert_eq!(res, Err(HalError::DuplicateCategory(HalCategory(*cat + 100)))),
            }
        }
        for (cat, expected) in first.iter().enumerate() {
            let got = hal.query(HalCategory(cat as u32 + 100), 0).ok();
            prop_assert_eq!(got, *expected);
        }
    }
}

struct Lang(HalCategory, i32);

impl ember_hal::HalProvider for Lang {
    fn category(&self) -> HalCategory {
        self.0
    }

    fn get(&self, _attribute: u32) -> ember_hal::Result<i32> {
        Ok(self.1)
    }
}

#[test]
fn provider_state_survives_a_snapshot() {
    let mut hal = HalRegistry::new();
    hal.register(
        HalCategory::VARIANT,
        Box::new(DeviceAttributes::new(DeviceConfig::default())),
    )
    .unwrap();
    hal.register(HalCategory::KERNEL, Box::new(KernelAttributes::new(1, (9, 4))))
        .unwrap();
    hal.update(HalCategory::KERNEL, attr::LANGUAGE, 13).unwrap();
    hal.update(HalCategory::VARIANT, attr::DISPLAY_STATE, 0).unwrap();

    let mut w = StateSerializer::writer(Compression::Lz4);
    hal.do_state(&mut w).unwrap();
    let image = w.into_bytes().unwrap();

    let mut fresh = HalRegistry::new();
    fresh
        .register(
            HalCategory::VARIANT,
            Box::new(DeviceAttributes::new(DeviceConfig::default())),
        )
        .unwrap();
    fresh
        .register(HalCategory::KERNEL, Box::new(KernelAttributes::new(1, (9, 4))))
        .unwrap();
    let mut r = StateSerializer::reader(&image).unwrap();
    fresh.do_state(&mut r).unwrap();

    assert_eq!(fresh.query(HalCategory::KERNEL, attr::LANGUAGE).unwrap(), 13);
    assert_eq!(fresh.query(HalCategory::VARIANT, attr::DISPLAY_STATE).unwrap(), 0);
}
