mod common;

use common::mem_alloc;
use pagedmem::{Pod, VPtr, VmError};

#[derive(Debug, Clone, Copy, PartialEq)]
struct Pair {
    x: i32,
    y: i32,
}

unsafe impl Pod for Pair {}

#[test]
fn value_store_and_load() {
    let alloc = mem_alloc(32 * 1024);
    let v = alloc.alloc_val(55i32).unwrap();
    assert_eq!(v.get(&alloc).unwrap(), 55);
    v.set(&alloc, -7).unwrap();
    assert_eq!(v.get(&alloc).unwrap(), -7);

    let f = alloc.alloc_val(1.5f64).unwrap();
    assert_eq!(f.get(&alloc).unwrap(), 1.5);
}

#[test]
fn indexing_scales_by_element() {
    let alloc = mem_alloc(32 * 1024);
    let arr: VPtr<u32> = alloc.alloc_array(8).unwrap();
    for i in 0..8 {
        arr.at(i).set(&alloc, (i as u32) * 11).unwrap();
    }
    let mut p = arr;
    for i in 0..8 {
        assert_eq!(p.get(&alloc).unwrap(), (i as u32) * 11);
        p.inc();
    }
    assert_eq!(p - arr, 8);
    assert_eq!((p - 3).get(&alloc).unwrap(), 55);
}

#[test]
fn wrapped_pointer_bypasses_the_pool() {
    let alloc = mem_alloc(32 * 1024);
    let data = [1i32, 2, 3, 4];
    let v = VPtr::wrap(&data[0]);
    assert_eq!(v.at(2).get(&alloc).unwrap(), 3);
    #[cfg(feature = "stats")]
    {
        // no backend traffic for wrapped access
        assert_eq!(alloc.stats().page_reads, 0);
        assert_eq!(alloc.stats().bytes_read, 0);
    }
}

#[test]
fn wrapped_pointer_store() {
    let alloc = mem_alloc(32 * 1024);
    let mut data = [0u16; 4];
    let v = VPtr::wrap_mut(&mut data[0]);
    v.at(1).set(&alloc, 500).unwrap();
    v.at(3).set(&alloc, 900).unwrap();
    assert_eq!(data, [0, 500, 0, 900]);
}

#[test]
fn struct_access_through_data_locks() {
    let alloc = mem_alloc(32 * 1024);
    let p = alloc.alloc_val(Pair { x: 0, y: 0 }).unwrap();
    alloc.clear_pages().unwrap();
    p.update(&alloc, |t| {
        t.x = 55;
        t.y = 33;
    })
    .unwrap();
    alloc.clear_pages().unwrap();
    let pair = p.with(&alloc, |t| *t).unwrap();
    assert_eq!(pair, Pair { x: 55, y: 33 });
    assert_eq!(p.get(&alloc).unwrap(), pair);
}

#[test]
fn struct_access_on_wrapped_pointer() {
    let alloc = mem_alloc(32 * 1024);
    let mut host = Pair { x: 22, y: 11 };
    let p = VPtr::wrap_mut(&mut host);
    assert_eq!(p.with(&alloc, |t| t.y).unwrap(), 11);
    p.update(&alloc, |t| t.x += 1).unwrap();
    drop(p);
    assert_eq!(host.x, 23);
}

#[test]
fn null_pointers_refuse_access() {
    let alloc = mem_alloc(32 * 1024);
    let p: VPtr<u32> = VPtr::null();
    assert!(p.is_null());
    assert!(matches!(
        p.get(&alloc),
        Err(VmError::InvalidAddress(0))
    ));
    assert!(matches!(
        p.set(&alloc, 1),
        Err(VmError::InvalidAddress(0))
    ));
}

#[test]
fn free_nulls_the_pointer() {
    let alloc = mem_alloc(32 * 1024);
    let mut p = alloc.alloc_val(9u8).unwrap();
    alloc.free(&mut p).unwrap();
    assert!(p.is_null());
    // double free of a nulled pointer is a no-op
    alloc.free(&mut p).unwrap();
}

#[test]
fn comparisons_respect_the_wrap_boundary() {
    let a: VPtr<u8> = VPtr::from_bits(100);
    let b: VPtr<u8> = VPtr::from_bits(200);
    assert!(a < b);
    assert_eq!(a, VPtr::from_bits(100));

    let x = 1u8;
    let w = VPtr::wrap(&x);
    assert_eq!(a.partial_cmp(&w), None);
    assert_ne!(a, w);
}

#[test]
fn values_survive_page_pressure() {
    let alloc = mem_alloc(33 * 1024);
    // more live values than the page cache can hold at once
    let mut ptrs = Vec::new();
    for i in 0..512u32 {
        ptrs.push(alloc.alloc_val(i.wrapping_mul(2654435761)).unwrap());
    }
    for (i, p) in ptrs.iter().enumerate() {
        assert_eq!(
            p.get(&alloc).unwrap(),
            (i as u32).wrapping_mul(2654435761)
        );
    }
}
