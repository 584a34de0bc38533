#![cfg(not(target_arch = "wasm32"))]

use std::collections::BTreeSet;

use ember_kernel::{Handle, Kernel, KernelConfig, KernelError, ObjectId};
use ember_mem::MemoryConfig;
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    Open(usize),
    Close(usize),
    Duplicate(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0usize..4).prop_map(Op::Open),
        (0usize..64).prop_map(Op::Close),
        (0usize..64).prop_map(Op::Duplicate),
    ]
}

proptest! {
    #[test]
    fn closed_handles_never_resolve_and_live_ones_never_alias(ops in proptest::collection::vec(op(), 1..96)) {
        let mut k = Kernel::new(KernelConfig::default(), MemoryConfig::default());
        let p = k.create_process("p", "p.exe", "").unwrap();
        let t = k.create_thread(p, "main", 0x1000, 0, 10, 0).unwrap();
        let objects: Vec<ObjectId> = (0..4)
            .map(|i| k.create_mutex(p, &format!("m{i}"), true).unwrap())
            .collect();

        let mut live: Vec<(Handle, ObjectId)> = Vec::new();
        let mut closed: Vec<Handle> = Vec::new();

        for op in ops {
            match op {
                Op::Open(i) => match k.open_handle(p, objects[i]) {
                    Ok(h) => live.push((h, objects[i])),
                    Err(KernelError::NoSuchObject(_)) => {}
                    Err(e) => prop_assert!(false, "unexpected error {e}"),
                },
                Op::Close(i) if !live.is_empty() => {
                    let (h, _) = live.remove(i % live.len());
                    k.close_handle(p, h).unwrap();
                    closed.push(h);
                }
                Op::Duplicate(i) if !live.is_empty() => {
                    let (h, obj) = live[i % live.len()];
                    let dup = k.duplicate_handle(p, t, h, p).unwrap();
                    live.push((dup, obj));
                }
                _ => {}
            }

            let distinct: BTreeSet<Handle> = live.iter().map(|(h, _)| *h).collect();
            prop_assert_eq!(distinct.len(), live.len());
            for &(h, obj) in &live {
                prop_assert_eq!(k.resolve_handle(p, t, h).unwrap(), obj);
            }
            for &h in &closed {
                prop_assert_eq!(k.resolve_handle(p, t, h), Err(KernelError::InvalidHandle(h)));
            }
            for &obj in &objects {
                let open = live.iter().filter(|(_, o)| *o == obj).count() as u32;
                match k.objects().get(obj) {
                    Ok(entry) => prop_assert_eq!(entry.refs(), open),
                    Err(_) => prop_assert_eq!(open, 0),
                }
            }
        }
    }
}

#[test]
fn pseudo_handles_name_the_caller() {
    let mut k = Kernel::new(KernelConfig::default(), MemoryConfig::default());
    let p = k.create_process("p", "p.exe", "").unwrap();
    let t = k.create_thread(p, "main", 0x1000, 0, 10, 0).unwrap();
    assert_eq!(k.resolve_handle(p, t, Handle::CURRENT_PROCESS).unwrap(), p);
    assert_eq!(k.resolve_handle(p, t, Handle::CURRENT_THREAD).unwrap(), t);
    assert_eq!(
        k.resolve_handle(p, t, Handle::NULL),
        Err(KernelError::InvalidHandle(Handle::NULL))
    );
    k.close_handle(p, Handle::CURRENT_THREAD).unwrap();
    assert!(k.thread(t).is_ok());
}
