use std::collections::BTreeMap;

use ember_snapshot::{Mode, SectionTag, Snapshot, SnapshotError, StateSerializer};
use tracing::{debug, warn};

use crate::error::{HalError, Result};
use crate::provider::{HalCategory, HalProvider};

const HAL_SECTION_VERSION: u16 = 1;
const MAX_PROVIDERS: usize = 1024;

/// Append-only table of HAL providers, at most one per category.
#[derive(Default)]
pub struct HalRegistry {
    providers: BTreeMap<HalCategory, Box<dyn HalProvider>>,
}

impl core::fmt::Debug for HalRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_set().entries(self.providers.keys()).finish()
    }
}

impl HalRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `provider` under `category`. An existing registration is never replaced.
    pub fn register(&mut self, category: HalCategory, provider: Box<dyn HalProvider>) -> Result<()> {
        if self.providers.contains_key(&category) {
            warn!(%category, "rejected duplicate HAL registration");
            return Err(HalError::DuplicateCategory(category));
        }
        debug!(%category, "registered HAL provider");
        self.providers.insert(category, provider);
        Ok(())
    }

    pub fn get(&self, category: HalCategory) -> Result<&dyn HalProvider> {
        self.providers
            .get(&category)
            .map(|p| p.as_ref())
            .ok_or(HalError::NotFound(category))
    }

    pub fn get_mut(&mut self, category: HalCategory) -> Result<&mut (dyn HalProvider + 'static)> {
        self.providers
            .get_mut(&category)
            .map(|p| p.as_mut())
            .ok_or(HalError::NotFound(category))
    }

    pub fn contains(&self, category: HalCategory) -> bool {
        self.providers.contains_key(&category)
    }

    pub fn categories(&self) -> impl Iterator<Item = HalCategory> + '_ {
        self.providers.keys().copied()
    }

    /// Consume the registry, yielding every provider in category order.
    pub fn into_providers(self) -> impl Iterator<Item = (HalCategory, Box<dyn HalProvider>)> {
        self.providers.into_iter()
    }

    /// Read one attribute through the provider registered for `category`.
    pub fn query(&self, category: HalCategory, attribute: u32) -> Result<i32> {
        self.get(category)?.get(attribute)
    }

    pub fn update(&mut self, category: HalCategory, attribute: u32, value: i32) -> Result<()> {
        self.get_mut(category)?.set(attribute, value)
    }

    /// Decode a HAL section and check it against the registered providers without applying it.
    pub fn stage_restore(&self, s: &mut StateSerializer<'_>) -> ember_snapshot::Result<StagedHal> {
        if !s.is_reading() {
            return Err(SnapshotError::WrongMode {
                required: Mode::Read,
                actual: s.mode(),
            });
        }
        let mut entries = Vec::new();
        s.section(SectionTag::HAL, HAL_SECTION_VERSION, |s, _| {
            absorb_entries(s, &mut entries)
        })?;
        for (category, bytes) in &entries {
            let provider = self
                .providers
                .get(&HalCategory(*category))
                .ok_or(SnapshotError::DanglingReference {
                    what: "HAL category",
                    id: u64::from(*category),
                })?;
            provider
                .check_state(bytes)
                .map_err(|_| SnapshotError::Corrupt("HAL provider rejected saved state"))?;
        }
        Ok(StagedHal { entries })
    }

    /// Apply a restore produced by [`stage_restore`](Self::stage_restore).
    pub fn commit_restore(&mut self, staged: StagedHal) {
        for (category, bytes) in staged.entries {
            if let Some(p) = self.providers.get_mut(&HalCategory(category)) {
                p.load_state(&bytes);
            }
        }
    }
}

/// A decoded HAL section that has been validated but not yet applied.
#[derive(Debug)]
pub struct StagedHal {
    entries: Vec<(u32, Vec<u8>)>,
}

fn absorb_entries(
    s: &mut StateSerializer<'_>,
    entries: &mut Vec<(u32, Vec<u8>)>,
) -> ember_snapshot::Result<()> {
    s.absorb_vec(entries, MAX_PROVIDERS, |s, (category, bytes)| {
        s.absorb_u32(category)?;
        s.absorb_bytes(bytes)
    })
}

impl Snapshot for HalRegistry {
    fn do_state(&mut self, s: &mut StateSerializer<'_>) -> ember_snapshot::Result<()> {
        match s.mode() {
            Mode::Write => {
                let mut entries: Vec<(u32, Vec<u8>)> = self
                    .providers
                    .iter()
                    .map(|(c, p)| (c.0, p.save_state()))
                    .collect();
                s.section(SectionTag::HAL, HAL_SECTION_VERSION, |s, _| {
                    absorb_entries(s, &mut entries)
                })
            }
            Mode::Read => {
                let staged = self.stage_restore(s)?;
                self.commit_restore(staged);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(HalCategory, i32);

    impl HalProvider for Fixed {
        fn category(&self) -> HalCategory {
            self.0
        }

        fn get(&self, attribute: u32) -> Result<i32> {
            match attribute {
                0 => Ok(self.1),
                _ => Err(HalError::UnknownAttribute {
                    category: self.0,
                    attribute,
                }),
            }
        }
    }

    #[test]
    fn second_registration_is_rejected_and_first_kept() {
        let mut hal = HalRegistry::new();
        let cat = HalCategory(7);
        hal.register(cat, Box::new(Fixed(cat, 1))).unwrap();
        assert_eq!(
            hal.register(cat, Box::new(Fixed(cat, 2))).unwrap_err(),
            HalError::DuplicateCategory(cat)
        );
        assert_eq!(hal.query(cat, 0).unwrap(), 1);
    }

    #[test]
    fn unknown_category_is_not_found() {
        let hal = HalRegistry::new();
        assert_eq!(
            hal.query(HalCategory::VARIANT, 0).unwrap_err(),
            HalError::NotFound(HalCategory::VARIANT)
        );
    }

    #[test]
    fn read_only_provider_rejects_set() {
        let mut hal = HalRegistry::new();
        let cat = HalCategory(3);
        hal.register(cat, Box::new(Fixed(cat, 1))).unwrap();
        assert!(matches!(
            hal.update(cat, 0, 5),
            Err(HalError::ReadOnly { .. })
        ));
    }

    #[test]
    fn restore_with_unregistered_category_fails() {
        let mut saved = HalRegistry::new();
        saved
            .register(HalCategory(9), Box::new(Fixed(HalCategory(9), 0)))
            .unwrap();
        let mut w = StateSerializer::writer(ember_snapshot::Compression::None);
        saved.do_state(&mut w).unwrap();
        let image = w.into_bytes().unwrap();

        let mut fresh = HalRegistry::new();
        let mut r = StateSerializer::reader(&image).unwrap();
        assert!(matches!(
            fresh.do_state(&mut r),
            Err(SnapshotError::DanglingReference { .. })
        ));
    }

    #[test]
    fn category_display() {
        assert_eq!(HalCategory::KERNEL.to_string(), "KERNEL(0)");
        assert_eq!(HalCategory(42).to_string(), "HAL_42");
    }
}
