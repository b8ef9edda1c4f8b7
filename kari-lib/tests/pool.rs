use kari_lib::PacketPool;

#[test]
fn accounting_invariant_holds() {
    let pool = PacketPool::new(64, 256).unwrap();
    assert_eq!(pool.stats().capacity, 64);
    assert_eq!(pool.stats().free, 64);

    let mut handles = Vec::new();
    for _ in 0..40 {
        handles.push(pool.alloc().unwrap());
    }
    let stats = pool.stats();
    assert_eq!(stats.free, 24);
    assert_eq!(stats.outstanding, 40);
    assert_eq!(stats.free + stats.outstanding, stats.capacity);

    handles.truncate(10);
    let stats = pool.stats();
    assert_eq!(stats.free, 54);
    assert_eq!(stats.free + stats.outstanding, stats.capacity);

    drop(handles);
    assert_eq!(pool.stats().free, 64);
}

#[test]
fn exhaustion_returns_none_without_blocking() {
    let pool = PacketPool::new(4, 128).unwrap();
    let handles: Vec<_> = (0..4).map(|_| pool.alloc().unwrap()).collect();
    assert!(pool.alloc().is_none());
    assert_eq!(pool.stats().alloc_failures, 1);
    drop(handles);
    assert!(pool.alloc().is_some());
}

#[test]
fn handles_grant_exclusive_buffers() {
    let pool = PacketPool::new(8, 64).unwrap();
    let mut a = pool.alloc().unwrap();
    let mut b = pool.alloc().unwrap();
    assert_ne!(a.index(), b.index());

    a.fill(&[0xAA; 16]);
    b.fill(&[0xBB; 16]);
    assert_eq!(&a[..], &[0xAA; 16]);
    assert_eq!(&b[..], &[0xBB; 16]);
}

#[test]
fn fill_truncates_at_capacity() {
    let pool = PacketPool::new(2, 32).unwrap();
    let mut handle = pool.alloc().unwrap();
    let written = handle.fill(&[0x42; 100]);
    assert_eq!(written, 32);
    assert_eq!(handle.len(), 32);
    assert_eq!(handle.capacity(), 32);
}

#[test]
fn freed_indices_are_reused() {
    let pool = PacketPool::new(1, 64).unwrap();
    let first = pool.alloc().unwrap();
    let index = first.index();
    drop(first);
    let second = pool.alloc().unwrap();
    assert_eq!(second.index(), index);
}

#[test]
fn concurrent_alloc_free_stays_consistent() {
    let pool = PacketPool::new(128, 128).unwrap();
    let mut threads = Vec::new();
    for _ in 0..4 {
        let pool = pool.clone();
        threads.push(std::thread::spawn(move || {
            for _ in 0..1000 {
                if let Some(mut handle) = pool.alloc() {
                    handle.fill(&[0x55; 64]);
                }
            }
        }));
    }
    for thread in threads {
        thread.join().unwrap();
    }
    let stats = pool.stats();
    assert_eq!(stats.free, 128);
    assert_eq!(stats.outstanding, 0);
}
