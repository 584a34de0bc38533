#![cfg(not(target_arch = "wasm32"))]

use ember_mem::ChunkSpec;
use ember_system::core::bytecode::{ByteCodeCore, Program};
use ember_system::{AccessError, FlatLoader, System, SystemConfig};
use proptest::prelude::*;

const PAGE: u64 = 0x1000;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Writes into the committed page read back verbatim; writes running past it are refused
    /// without touching the committed part.
    #[test]
    fn writes_are_all_or_nothing(
        writes in proptest::collection::vec((0u64..PAGE + 64, proptest::collection::vec(any::<u8>(), 1..96)), 1..24)
    ) {
        let mut p = Program::new();
        p.halt();
        let loader = FlatLoader::new().with_image("c:\\a.exe", p.into_bytes());
        let mut s = System::new(SystemConfig::default(), ByteCodeCore::new(), loader).unwrap();
        s.startup().unwrap();
        let pid = s.load("c:\\a.exe", "").unwrap();
        let base = {
            let k = s.kernel_mut();
            let chunk = k.create_chunk(pid, ChunkSpec::local("scratch", 2 * PAGE), PAGE).unwrap();
            k.open_handle(pid, chunk).unwrap();
            let id = k.chunk_of(chunk).unwrap();
            k.mem().chunk(id).unwrap().base()
        };

        let mut model = vec![0u8; PAGE as usize];
        let mut view = s.process_view(pid).unwrap();
        for (offset, bytes) in writes {
            let end = offset + bytes.len() as u64;
            let result = view.write(base + offset, &bytes);
            if end <= PAGE {
                prop_assert_eq!(result, Ok(()));
                model[offset as usize..end as usize].copy_from_slice(&bytes);
            } else {
                let first_bad = base + offset.max(PAGE);
                prop_assert_eq!(result, Err(AccessError::Unmapped { addr: first_bad }));
            }
        }
        prop_assert_eq!(view.read(base, PAGE as usize).unwrap(), model);
    }
}
