use std::collections::HashMap;
use std::sync::Arc;

use tessella::comm::{Communicator, SelfComm};
use tessella::{Error, GhostState, StencilVector};

use super::{build_cart, on_ranks};

#[test]
fn access_is_bounds_checked_against_the_padded_buffer() {
    let cart = build_cart(Arc::new(SelfComm::new()), [4], [1], [false]);
    let mut v = StencilVector::<f64, 1>::new(cart);
    v.set(&[-1], 2.0).unwrap();
    v.set(&[4], 3.0).unwrap();
    assert_eq!(v.get(&[-1]).unwrap(), 2.0);
    assert_eq!(v.get(&[4]).unwrap(), 3.0);
    assert!(matches!(v.get(&[-2]), Err(Error::Index { .. })));
    assert!(matches!(v.set(&[5], 0.0), Err(Error::Index { .. })));
}

#[test]
fn axpy_combines_ghost_entries_too() {
    let cart = build_cart(Arc::new(SelfComm::new()), [3], [1], [false]);
    let mut x = StencilVector::<f64, 1>::new(Arc::clone(&cart));
    let mut y = StencilVector::<f64, 1>::new(cart);
    // A pending scatter contribution in the pad must combine linearly.
    x.add(&[-1], 1.5).unwrap();
    x.set(&[0], 2.0).unwrap();
    y.set(&[0], 10.0).unwrap();
    y.axpy(2.0, &x).unwrap();
    assert_eq!(y.get(&[-1]).unwrap(), 3.0);
    assert_eq!(y.get(&[0]).unwrap(), 14.0);
    assert_eq!(y.ghost_state(), GhostState::Pending);
}

#[test]
fn operations_between_different_spaces_are_rejected() {
    let a = build_cart(Arc::new(SelfComm::new()), [4], [1], [false]);
    let b = build_cart(Arc::new(SelfComm::new()), [5], [1], [false]);
    let mut x = StencilVector::<f64, 1>::new(a);
    let y = StencilVector::<f64, 1>::new(b);
    assert!(matches!(x.axpy(1.0, &y), Err(Error::ShapeMismatch { .. })));
    assert!(matches!(x.dot(&y), Err(Error::ShapeMismatch { .. })));
}

#[test]
fn distributed_dot_matches_the_gathered_reference() {
    // Integer-valued entries keep every partial sum exact, so the
    // distributed reduction must agree bitwise with the serial sum.
    let reference: f64 = (0..12).map(|g| ((g + 1) * (g + 2)) as f64).sum();
    for ranks in [1, 2, 4] {
        let dots = on_ranks(ranks, |comm| {
            let cart = build_cart(comm, [12], [1], [false]);
            let mut x = StencilVector::<f64, 1>::new(Arc::clone(&cart));
            let mut y = StencilVector::<f64, 1>::new(Arc::clone(&cart));
            for g in 0..12usize {
                if let Some(local) = cart.global_to_local(&[g]) {
                    if cart.is_interior(&local) {
                        x.set(&local, (g + 1) as f64).unwrap();
                        y.set(&local, (g + 2) as f64).unwrap();
                    }
                }
            }
            x.dot(&y).unwrap()
        });
        for dot in dots {
            assert_eq!(dot, reference, "with {ranks} ranks");
        }
    }
}

#[test]
fn norm_reduces_interior_entries_only() {
    let cart = build_cart(Arc::new(SelfComm::new()), [4], [1], [false]);
    let mut v = StencilVector::<f64, 1>::new(cart);
    for i in 0..4 {
        v.set(&[i], 2.0).unwrap();
    }
    // Garbage in the pads must not enter the reduction.
    v.set(&[-1], 100.0).unwrap();
    v.set(&[4], 100.0).unwrap();
    assert_eq!(v.norm().unwrap(), 4.0);
}

#[test]
fn complex_dot_conjugates_the_left_argument() {
    use tessella::nalgebra::Complex;
    let cart = build_cart(Arc::new(SelfComm::new()), [2], [0], [false]);
    let mut x = StencilVector::<Complex<f64>, 1>::new(Arc::clone(&cart));
    let mut y = StencilVector::<Complex<f64>, 1>::new(cart);
    x.set(&[0], Complex::new(1.0, 2.0)).unwrap();
    x.set(&[1], Complex::new(0.0, -1.0)).unwrap();
    y.set(&[0], Complex::new(3.0, -1.0)).unwrap();
    y.set(&[1], Complex::new(2.0, 2.0)).unwrap();
    let expected = Complex::new(1.0, -2.0) * Complex::new(3.0, -1.0)
        + Complex::new(0.0, 1.0) * Complex::new(2.0, 2.0);
    assert_eq!(x.dot(&y).unwrap(), expected);
}

#[test]
fn halo_refresh_mirrors_neighbor_interiors() {
    let results = on_ranks(2, |comm| {
        let cart = build_cart(comm, [10], [1], [false]);
        let mut v = StencilVector::<f64, 1>::new(Arc::clone(&cart));
        for g in 0..10usize {
            if let Some(local) = cart.global_to_local(&[g]) {
                if cart.is_interior(&local) {
                    v.set(&local, (g * g) as f64).unwrap();
                }
            }
        }
        v.update_ghost_regions().unwrap();
        if cart.comm().rank() == 0 {
            // Plus-side ghost holds global index 5.
            v.get(&[5]).unwrap()
        } else {
            // Minus-side ghost holds global index 4.
            v.get(&[-1]).unwrap()
        }
    });
    assert_eq!(results, vec![25.0, 16.0]);
}

#[test]
fn overlapping_seam_contributions_sum_on_both_sides() {
    // Global shape [10] over two ranks, split [5, 5]: the cell between
    // indices 4 and 5 is owned by rank 0 but touches index 5, which rank 1
    // owns; the cell above is owned by rank 1 and touches index 5 too.
    let results = on_ranks(2, |comm| {
        let cart = build_cart(comm, [10], [1], [false]);
        let mut v = StencilVector::<f64, 1>::new(Arc::clone(&cart));
        if cart.comm().rank() == 0 {
            v.add(&[5], 2.0).unwrap();
        } else {
            v.add(&[0], 3.0).unwrap();
        }
        v.update_ghost_regions().unwrap();
        let local = cart.global_to_local(&[5]).unwrap();
        v.get(&local).unwrap()
    });
    assert_eq!(results, vec![5.0, 5.0]);
}

#[test]
fn ghost_entries_equal_the_owners_interior_after_update() {
    for ranks in [1, 2, 4] {
        // Every rank contributes 1 at every in-range position of its padded
        // buffer, like a scatter whose cells cover the whole pad.
        let results = on_ranks(ranks, |comm| {
            let cart = build_cart(comm, [10, 10], [2, 2], [false, false]);
            let mut v = StencilVector::<f64, 2>::new(Arc::clone(&cart));
            let pads = cart.pads();
            let local_shape = cart.local_shape();
            let in_range = |g: &[i64; 2]| (0..10).contains(&g[0]) && (0..10).contains(&g[1]);
            for i in -(pads[0] as i64)..(local_shape[0] + pads[0]) as i64 {
                for j in -(pads[1] as i64)..(local_shape[1] + pads[1]) as i64 {
                    if in_range(&cart.local_to_global(&[i, j])) {
                        v.add(&[i, j], 1.0).unwrap();
                    }
                }
            }
            v.update_ghost_regions().unwrap();
            let mut entries = Vec::new();
            for i in -(pads[0] as i64)..(local_shape[0] + pads[0]) as i64 {
                for j in -(pads[1] as i64)..(local_shape[1] + pads[1]) as i64 {
                    let g = cart.local_to_global(&[i, j]);
                    if in_range(&g) {
                        entries.push((
                            [g[0] as usize, g[1] as usize],
                            v.get(&[i, j]).unwrap(),
                            cart.is_interior(&[i, j]),
                        ));
                    }
                }
            }
            entries
        });

        // Canonical value per global index, read off the owner's interior.
        let mut canonical = HashMap::new();
        let mut coverage = HashMap::new();
        for entries in &results {
            for (global, value, interior) in entries {
                *coverage.entry(*global).or_insert(0usize) += 1;
                if *interior {
                    assert!(canonical.insert(*global, *value).is_none());
                }
            }
        }
        // The canonical value counts how many padded buffers cover the
        // index, and every ghost copy agrees with it.
        for (global, value) in &canonical {
            assert_eq!(*value, coverage[global] as f64, "at {global:?}, {ranks} ranks");
        }
        for entries in &results {
            for (global, value, _) in entries {
                assert_eq!(value, &canonical[global], "at {global:?}, {ranks} ranks");
            }
        }
    }
}

#[test]
fn ghost_update_is_idempotent() {
    let states = on_ranks(2, |comm| {
        let cart = build_cart(comm, [10], [2], [false]);
        let mut v = StencilVector::<f64, 1>::new(Arc::clone(&cart));
        for g in 0..10usize {
            if let Some(local) = cart.global_to_local(&[g]) {
                if cart.is_interior(&local) {
                    v.set(&local, (g + 1) as f64).unwrap();
                }
            }
        }
        v.update_ghost_regions().unwrap();
        let after_first = v.buffer().to_vec();
        v.update_ghost_regions().unwrap();
        assert_eq!(v.buffer(), &after_first[..]);
        v.ghost_state()
    });
    for state in states {
        assert_eq!(state, GhostState::InSync);
    }
}

#[test]
fn periodic_ring_wraps_the_halo_across_ranks() {
    let results = on_ranks(2, |comm| {
        let cart = build_cart(comm, [8], [1], [true]);
        let mut v = StencilVector::<f64, 1>::new(Arc::clone(&cart));
        for g in 0..8usize {
            if let Some(local) = cart.global_to_local(&[g]) {
                if cart.is_interior(&local) {
                    v.set(&local, (g + 1) as f64).unwrap();
                }
            }
        }
        v.update_ghost_regions().unwrap();
        let n = cart.local_shape()[0] as i64;
        (v.get(&[-1]).unwrap(), v.get(&[n]).unwrap())
    });
    // Rank 0 owns 0..=3, rank 1 owns 4..=7; the ring closes at both ends.
    assert_eq!(results, vec![(8.0, 5.0), (4.0, 1.0)]);
}

#[test]
fn interior_export_is_row_major() {
    let cart = build_cart(Arc::new(SelfComm::new()), [2, 3], [1, 1], [false, false]);
    let mut v = StencilVector::<f64, 2>::new(cart);
    for i in 0..2i64 {
        for j in 0..3i64 {
            v.set(&[i, j], (i * 3 + j) as f64).unwrap();
        }
    }
    assert_eq!(v.interior_to_vec(), vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
}
