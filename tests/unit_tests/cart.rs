use std::sync::Arc;

use tessella::cart::{CartBuilder, Side};
use tessella::comm::{Communicator, SelfComm};
use tessella::Error;

use super::{build_cart, on_ranks};

#[test]
fn interiors_tile_the_global_space_without_overlap() {
    for ranks in [1, 2, 4] {
        let owned = on_ranks(ranks, |comm| {
            let cart = build_cart(comm, [10, 7], [1, 1], [false, false]);
            (cart.starts(), cart.ends())
        });
        let mut cover = [[0u32; 7]; 10];
        for (starts, ends) in owned {
            for i in starts[0]..=ends[0] {
                for j in starts[1]..=ends[1] {
                    cover[i][j] += 1;
                }
            }
        }
        assert!(
            cover.iter().flatten().all(|&count| count == 1),
            "{ranks} ranks do not tile the space exactly once"
        );
    }
}

#[test]
fn remainder_goes_to_the_lowest_coordinates() {
    let results = on_ranks(4, |comm| {
        let cart = build_cart(comm, [10], [0], [false]);
        (cart.coords()[0], cart.starts()[0], cart.local_shape()[0])
    });
    assert_eq!(results, vec![(0, 0, 3), (1, 3, 3), (2, 6, 2), (3, 8, 2)]);
}

#[test]
fn partition_tables_are_identical_on_every_rank() {
    let tables = on_ranks(2, |comm| {
        let cart = build_cart(comm, [9], [1], [false]);
        cart.partition(0).collect::<Vec<_>>()
    });
    for table in &tables {
        assert_eq!(*table, vec![(0, 5), (5, 4)]);
    }
}

#[test]
fn neighbor_ranks_follow_the_process_grid() {
    let neighbors = on_ranks(2, |comm| {
        let cart = build_cart(comm, [8], [1], [false]);
        (cart.neighbor(0, Side::Minus), cart.neighbor(0, Side::Plus))
    });
    assert_eq!(neighbors, vec![(None, Some(1)), (Some(0), None)]);

    let wrapped = on_ranks(2, |comm| {
        let cart = build_cart(comm, [8], [1], [true]);
        (cart.neighbor(0, Side::Minus), cart.neighbor(0, Side::Plus))
    });
    assert_eq!(wrapped, vec![(Some(1), Some(1)), (Some(0), Some(0))]);
}

#[test]
fn single_rank_periodic_axis_neighbors_itself() {
    let cart = build_cart(Arc::new(SelfComm::new()), [5], [1], [true]);
    assert_eq!(cart.neighbor(0, Side::Minus), Some(0));
    assert_eq!(cart.neighbor(0, Side::Plus), Some(0));
}

#[test]
fn invalid_configurations_are_rejected() {
    let comm: Arc<dyn Communicator> = Arc::new(SelfComm::new());
    // Explicit grid that does not match the communicator size.
    let err = CartBuilder::new(&[8])
        .process_grid(&[2])
        .build::<1>(Arc::clone(&comm))
        .unwrap_err();
    assert!(matches!(err, Error::Configuration { .. }));
    // Pad wider than the smallest local extent.
    let err = CartBuilder::new(&[4])
        .pads(&[5])
        .build::<1>(Arc::clone(&comm))
        .unwrap_err();
    assert!(matches!(err, Error::Configuration { .. }));
    // Zero extent.
    let err = CartBuilder::new(&[0]).build::<1>(comm).unwrap_err();
    assert!(matches!(err, Error::Configuration { .. }));
}

#[test]
fn more_processes_than_grid_points_is_rejected() {
    // Reported on every rank before any communication happens.
    let failures = on_ranks(4, |comm| CartBuilder::new(&[3]).build::<1>(comm).err());
    for failure in failures {
        assert!(matches!(failure, Some(Error::Configuration { .. })));
    }
}

#[test]
fn owner_lookup_and_index_conversion_agree() {
    let results = on_ranks(2, |comm| {
        let cart = build_cart(comm, [10], [1], [false]);
        let rank = cart.comm().rank();
        let mut owned = Vec::new();
        for g in 0..10 {
            if cart.owner_of(&[g]).unwrap() == rank {
                let local = cart.global_to_local(&[g]).unwrap();
                assert!(cart.is_interior(&local));
                assert_eq!(cart.local_to_global(&local), [g as i64]);
                owned.push(g);
            }
        }
        owned
    });
    assert_eq!(results[0], (0..5).collect::<Vec<_>>());
    assert_eq!(results[1], (5..10).collect::<Vec<_>>());
}

#[test]
fn builder_round_trips_through_serde() {
    let builder = CartBuilder::new(&[10, 10])
        .pads(&[2, 2])
        .periodic(&[true, false]);
    let json = serde_json::to_string(&builder).unwrap();
    let restored: CartBuilder = serde_json::from_str(&json).unwrap();
    let cart = restored.build::<2>(Arc::new(SelfComm::new())).unwrap();
    assert_eq!(cart.global_shape(), [10, 10]);
    assert_eq!(cart.pads(), [2, 2]);
    assert_eq!(cart.periods(), [true, false]);
}
