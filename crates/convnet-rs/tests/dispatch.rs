use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::bail;
use convnet_rs::Dispatcher;

#[test]
fn batch_runs_every_index_once() {
    let dispatcher = Dispatcher::new(4).unwrap();
    let total = AtomicUsize::new(0);
    let count = AtomicUsize::new(0);
    dispatcher
        .batch(100, |n| {
            total.fetch_add(n, Ordering::Relaxed);
            count.fetch_add(1, Ordering::Relaxed);
            Ok(())
        })
        .unwrap();
    assert_eq!(count.load(Ordering::Relaxed), 100);
    assert_eq!(total.load(Ordering::Relaxed), 99 * 100 / 2);
}

#[test]
fn batch_surfaces_a_unit_failure_after_the_barrier() {
    let dispatcher = Dispatcher::new(2).unwrap();
    let err = dispatcher
        .batch(16, |n| {
            if n == 7 {
                bail!("unit {} exploded", n);
            }
            Ok(())
        })
        .unwrap_err();
    assert!(err.to_string().contains("exploded"));
}

#[test]
fn batch_rows_hands_each_unit_its_own_row() {
    let dispatcher = Dispatcher::new(4).unwrap();
    let mut data = vec![0.0f32; 6 * 5];
    dispatcher
        .batch_rows(&mut data, 5, |n, row| {
            assert_eq!(row.len(), 5);
            for v in row.iter_mut() {
                *v = n as f32;
            }
            Ok(())
        })
        .unwrap();
    for (n, chunk) in data.chunks(5).enumerate() {
        assert!(chunk.iter().all(|&v| v == n as f32));
    }
}

#[test]
fn batch_rows_with_empty_input_is_a_no_op() {
    let dispatcher = Dispatcher::new(2).unwrap();
    let mut data: Vec<f32> = Vec::new();
    dispatcher.batch_rows(&mut data, 4, |_, _| Ok(())).unwrap();
}

#[test]
fn batch_sum_merges_private_partials() {
    let dispatcher = Dispatcher::new(4).unwrap();
    let totals = dispatcher
        .batch_sum(
            100,
            || vec![0.0f32; 2],
            |acc, n| {
                acc[0] += n as f32;
                acc[1] += 1.0;
                Ok(())
            },
            |mut a, b| {
                for (x, y) in a.iter_mut().zip(b) {
                    *x += y;
                }
                a
            },
        )
        .unwrap();
    assert_eq!(totals[0], (99 * 100 / 2) as f32);
    assert_eq!(totals[1], 100.0);
}

#[test]
fn batch_sum_propagates_unit_failure() {
    let dispatcher = Dispatcher::new(2).unwrap();
    let err = dispatcher
        .batch_sum(
            8,
            || 0.0f32,
            |_, n| {
                if n == 3 {
                    bail!("bad sample");
                }
                Ok(())
            },
            |a, b| a + b,
        )
        .unwrap_err();
    assert!(err.to_string().contains("bad sample"));
}
