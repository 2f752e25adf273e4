//! End-to-end scenarios against real RDMA hardware.
//!
//! These need an HCA with an active port (loopback is enough), so they
//! are ignored by default: `cargo test -- --ignored` on a capable host.

use std::time::Duration;

use remex::{
    ConnectionManager, DoorbellBatchBuilder, MemoryPool, Peer, Result, WritePolicy,
};

fn local_ip() -> String {
    local_ip_address::local_ip()
        .expect("host has a local IP")
        .to_string()
}

fn retry_unavailable<T>(mut f: impl FnMut() -> Result<T>) -> T {
    loop {
        match f() {
            Ok(v) => return v,
            Err(e) if e.is_unavailable() => std::thread::sleep(Duration::from_millis(1)),
            Err(e) => panic!("unexpected error: {}", e),
        }
    }
}

#[test]
#[ignore = "requires RDMA hardware"]
fn loopback_self_connect() {
    let _ = env_logger::builder().is_test(true).try_init();
    let ip = local_ip();

    let cm = ConnectionManager::new(1);
    cm.start(&ip, Some(18018)).unwrap();

    let conn = retry_unavailable(|| cm.connect(1, &ip, 18018));
    assert!(conn.is_loopback());
    assert_eq!(conn.peer_id(), 1);

    let again = cm.get_connection(1).unwrap();
    assert!(std::sync::Arc::ptr_eq(&conn, &again));
    assert_eq!(cm.num_connections(), 1);

    cm.shutdown();
    drop(cm); // Must not hang.
}

#[test]
#[ignore = "requires RDMA hardware"]
fn loopback_channel_round_trip() {
    let _ = env_logger::builder().is_test(true).try_init();
    let ip = local_ip();

    let cm = ConnectionManager::new(1);
    cm.start(&ip, Some(18019)).unwrap();
    let conn = retry_unavailable(|| cm.connect(1, &ip, 18019));

    for i in 0..8 {
        let msg = format!("message {}", i);
        conn.channel().send(&msg).unwrap();
        let got: String = retry_unavailable(|| conn.channel().try_deliver());
        assert_eq!(got, msg);
    }
}

#[test]
#[ignore = "requires RDMA hardware"]
fn cross_manager_connect() {
    let _ = env_logger::builder().is_test(true).try_init();
    let ip = local_ip();

    let a = ConnectionManager::new(1);
    a.start(&ip, None).unwrap();
    let b = ConnectionManager::new(42);
    b.start(&ip, None).unwrap();

    let b_to_a = retry_unavailable(|| b.connect(1, &ip, a.port().unwrap()));
    assert_eq!(b_to_a.peer_id(), 1);

    // A records the incoming peer once its broker accepts.
    let a_to_b = retry_unavailable(|| a.get_connection(42).map_err(downgrade_not_found));
    assert_eq!(a_to_b.peer_id(), 42);

    b_to_a.channel().send(&"ping".to_string()).unwrap();
    let got: String = retry_unavailable(|| a_to_b.channel().try_deliver());
    assert_eq!(got, "ping");

    a_to_b.channel().send(&"pong".to_string()).unwrap();
    let got: String = retry_unavailable(|| b_to_a.channel().try_deliver());
    assert_eq!(got, "pong");
}

/// `NotFound` during convergence is as retryable as `Unavailable`.
fn downgrade_not_found<T>(e: remex::Error) -> remex::Error {
    if e.is_not_found() {
        remex::Error::Unavailable("not yet accepted".into())
    } else {
        e
    }
}

#[test]
#[ignore = "requires RDMA hardware"]
fn simultaneous_fully_connected_mesh() {
    use std::sync::{Arc, Barrier};

    let _ = env_logger::builder().is_test(true).try_init();
    const N: u16 = 4;
    let ip = local_ip();

    let managers: Vec<Arc<ConnectionManager>> = (1..=N)
        .map(|id| {
            let cm = ConnectionManager::new(id);
            cm.start(&ip, None).unwrap();
            Arc::new(cm)
        })
        .collect();
    let ports: Vec<u16> = managers.iter().map(|m| m.port().unwrap()).collect();

    let barrier = Arc::new(Barrier::new(N as usize));
    let handles: Vec<_> = managers
        .iter()
        .map(|cm| {
            let cm = Arc::clone(cm);
            let ip = ip.clone();
            let ports = ports.clone();
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                barrier.wait();
                // Shuffled enough: start from our own id and wrap.
                for offset in 0..N {
                    let peer = (cm.my_id() + offset - 1) % N + 1;
                    retry_unavailable(|| cm.connect(peer, &ip, ports[peer as usize - 1]));
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    for cm in &managers {
        assert_eq!(cm.num_connections(), N as usize);
    }
}

fn loopback_pool(id: u16, port: u16, capacity: usize) -> (MemoryPool, Peer) {
    let me = Peer::new(id, local_ip(), port);
    let cm = ConnectionManager::new(id);
    let mut pool = MemoryPool::new(me.clone(), cm, false);
    pool.init(capacity, std::slice::from_ref(&me)).unwrap();
    (pool, me)
}

#[test]
#[ignore = "requires RDMA hardware"]
fn write_then_read() {
    let _ = env_logger::builder().is_test(true).try_init();
    let (pool, _me) = loopback_pool(1, 18020, 1 << 20);

    let target = pool.allocate::<u64>(1);
    assert!(!target.is_null());

    const VALUE: u64 = 0xF0F0_F0F0_F0F0_F0F0;
    pool.write(target, VALUE, None, WritePolicy::WaitForResponse)
        .unwrap();

    let local = pool.read(target, None, None).unwrap();
    assert_eq!(unsafe { *local.deref_local() }, VALUE);

    pool.deallocate(local, 1);
    pool.deallocate(target, 1);
}

#[test]
#[ignore = "requires RDMA hardware"]
fn compare_and_swap_semantics() {
    let _ = env_logger::builder().is_test(true).try_init();
    let (pool, _me) = loopback_pool(1, 18021, 1 << 20);

    let target = pool.allocate::<u64>(1);
    pool.write(target, 10u64, None, WritePolicy::WaitForResponse)
        .unwrap();

    // Matching expectation installs the swap.
    assert_eq!(pool.compare_and_swap(target, 10, 20).unwrap(), 10);
    // Stale expectation leaves the target untouched.
    assert_eq!(pool.compare_and_swap(target, 10, 30).unwrap(), 20);

    // AtomicSwap lands regardless of the hint.
    assert_eq!(pool.atomic_swap(target, 40, 0).unwrap(), 20);
    let local = pool.read(target, None, None).unwrap();
    assert_eq!(unsafe { *local.deref_local() }, 40);
}

#[test]
#[ignore = "requires RDMA hardware"]
fn extended_and_partial_reads() {
    let _ = env_logger::builder().is_test(true).try_init();
    let (pool, _me) = loopback_pool(1, 18023, 1 << 20);

    const N: usize = 8;
    let array = pool.allocate::<u64>(N);
    let mut elem = array;
    for i in 0..N {
        pool.write(elem, 100 + i as u64, None, WritePolicy::WaitForResponse)
            .unwrap();
        elem += 1;
    }

    let local = pool.extended_read(array, N, None, None).unwrap();
    for i in 0..N {
        assert_eq!(unsafe { *(local + i).deref_local() }, 100 + i as u64);
    }

    // Just the second element, read as raw bytes of the array object.
    let partial = pool
        .partial_read(array.cast::<[u64; N]>(), 8, 8, None)
        .unwrap();
    let second = unsafe { *(partial.cast::<u64>() + 1).deref_local() };
    assert_eq!(second, 101);
}

#[test]
#[ignore = "requires RDMA hardware"]
fn shared_completion_mode() {
    let _ = env_logger::builder().is_test(true).try_init();
    let me = Peer::new(1, local_ip(), 18024);
    let cm = ConnectionManager::new(1);
    let mut pool = MemoryPool::new(me.clone(), cm, true);
    pool.init(1 << 20, std::slice::from_ref(&me)).unwrap();

    pool.register_thread();
    let target = pool.allocate::<u64>(1);
    pool.write(target, 77, None, WritePolicy::WaitForResponse)
        .unwrap();
    let local = pool.read(target, None, None).unwrap();
    assert_eq!(unsafe { *local.deref_local() }, 77);

    pool.kill_worker_thread();
}

#[test]
#[ignore = "requires RDMA hardware"]
fn doorbell_write_then_read() {
    let _ = env_logger::builder().is_test(true).try_init();
    let (pool, me) = loopback_pool(1, 18022, 1 << 20);

    let dest = pool.allocate::<u64>(1);
    const VALUE: u64 = 0xABCD_EF01_2345_6789;

    let mut builder = DoorbellBatchBuilder::new(&pool, me.id, 2).unwrap();
    builder.add_write(dest, VALUE, false).unwrap();
    let read_dst = builder.add_read(dest, true, None).unwrap();
    let mut batch = builder.build();

    pool.execute(&mut batch).unwrap();

    assert_eq!(unsafe { *dest.deref_local() }, VALUE);
    assert_eq!(unsafe { *read_dst.deref_local() }, VALUE);
}
