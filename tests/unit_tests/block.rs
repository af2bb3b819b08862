use std::sync::Arc;

use tessella::comm::{Communicator, SelfComm};
use tessella::{BlockMatrix, BlockVector, Error, StencilMatrix, StencilVector};

use super::{build_cart, on_ranks};

fn filled_vector(cart: &Arc<tessella::CartDecomposition<1>>, f: impl Fn(i64) -> f64) -> StencilVector<f64, 1> {
    let mut v = StencilVector::new(Arc::clone(cart));
    for i in 0..cart.local_shape()[0] as i64 {
        v.set(&[i], f(cart.local_to_global(&[i])[0])).unwrap();
    }
    v
}

#[test]
fn block_dot_sums_the_per_block_inner_products() {
    let cart = build_cart(Arc::new(SelfComm::new()), [4], [1], [false]);
    let u0 = filled_vector(&cart, |g| (g + 1) as f64);
    let u1 = filled_vector(&cart, |g| (2 * g) as f64);
    let u = BlockVector::from_blocks(vec![u0.clone(), u1.clone()]).unwrap();
    let w = BlockVector::from_blocks(vec![u1.clone(), u0.clone()]).unwrap();
    let expected = u0.dot(&u1).unwrap() + u1.dot(&u0).unwrap();
    assert_eq!(u.dot(&w).unwrap(), expected);
    assert_eq!(u.norm().unwrap(), u.dot(&u).unwrap().sqrt());
}

#[test]
fn block_structure_mismatches_are_rejected() {
    let cart = build_cart(Arc::new(SelfComm::new()), [4], [1], [false]);
    let single =
        BlockVector::from_blocks(vec![StencilVector::<f64, 1>::new(Arc::clone(&cart))]).unwrap();
    let mut double = BlockVector::from_blocks(vec![
        StencilVector::<f64, 1>::new(Arc::clone(&cart)),
        StencilVector::<f64, 1>::new(cart),
    ])
    .unwrap();
    assert!(matches!(double.axpy(1.0, &single), Err(Error::ShapeMismatch { .. })));
    assert!(matches!(double.dot(&single), Err(Error::ShapeMismatch { .. })));
    assert!(BlockVector::<f64, 1>::from_blocks(vec![]).is_err());
}

#[test]
fn block_product_accumulates_along_block_rows() {
    let cart = build_cart(Arc::new(SelfComm::new()), [5], [1], [false]);
    let mut a00 = StencilMatrix::<f64, 1>::square(Arc::clone(&cart)).unwrap();
    let mut a01 = StencilMatrix::<f64, 1>::square(Arc::clone(&cart)).unwrap();
    let mut a11 = StencilMatrix::<f64, 1>::square(Arc::clone(&cart)).unwrap();
    for row in 0..5i64 {
        for k in -1..=1i64 {
            a00.set(&[row], &[k], (row + k + 2) as f64).unwrap();
            a01.set(&[row], &[k], (2 * row - k) as f64).unwrap();
            a11.set(&[row], &[k], (row * k + 3) as f64).unwrap();
        }
    }
    let mut x0 = filled_vector(&cart, |g| (g + 1) as f64);
    let mut x1 = filled_vector(&cart, |g| (g * g) as f64);
    x0.update_ghost_regions().unwrap();
    x1.update_ghost_regions().unwrap();

    let mut blocks = BlockMatrix::new(2, 2).unwrap();
    blocks.set_block(0, 0, a00.clone()).unwrap();
    blocks.set_block(0, 1, a01.clone()).unwrap();
    blocks.set_block(1, 1, a11.clone()).unwrap();

    let x = BlockVector::from_blocks(vec![x0.clone(), x1.clone()]).unwrap();
    let y = blocks.dot(&x).unwrap();

    // Block row 0 sums both column blocks; the absent (1, 0) block is a
    // zero operator.
    let mut y0 = a00.dot(&x0).unwrap();
    y0.axpy(1.0, &a01.dot(&x1).unwrap()).unwrap();
    let y1 = a11.dot(&x1).unwrap();
    assert_eq!(y.block(0).interior_to_vec(), y0.interior_to_vec());
    assert_eq!(y.block(1).interior_to_vec(), y1.interior_to_vec());
}

#[test]
fn an_empty_block_row_cannot_be_applied() {
    let cart = build_cart(Arc::new(SelfComm::new()), [5], [1], [false]);
    let a = StencilMatrix::<f64, 1>::square(Arc::clone(&cart)).unwrap();
    let mut blocks = BlockMatrix::new(2, 1).unwrap();
    blocks.set_block(0, 0, a).unwrap();
    let x = BlockVector::from_blocks(vec![StencilVector::<f64, 1>::new(cart)]).unwrap();
    assert!(matches!(blocks.dot(&x), Err(Error::ShapeMismatch { .. })));
}

#[test]
fn block_rows_and_columns_must_agree_on_their_spaces() {
    let comm: Arc<dyn Communicator> = Arc::new(SelfComm::new());
    let big = build_cart(Arc::clone(&comm), [8], [1], [false]);
    let small = build_cart(comm, [6], [1], [false]);
    let square = StencilMatrix::<f64, 1>::square(Arc::clone(&big)).unwrap();
    // Maps the big space into the small one, so its codomain disagrees
    // with the square block already in the row.
    let rectangular =
        StencilMatrix::<f64, 1>::new(Arc::clone(&big), Arc::clone(&small), [1]).unwrap();
    let mut blocks = BlockMatrix::new(1, 2).unwrap();
    blocks.set_block(0, 0, square).unwrap();
    let err = blocks.set_block(0, 1, rectangular).unwrap_err();
    assert!(matches!(err, Error::ShapeMismatch { .. }));
}

#[test]
fn block_ghost_update_reconciles_every_field() {
    let results = on_ranks(2, |comm| {
        let cart = build_cart(comm, [10], [1], [false]);
        let rank = cart.comm().rank();
        let mut u0 = StencilVector::<f64, 1>::new(Arc::clone(&cart));
        let mut u1 = StencilVector::<f64, 1>::new(Arc::clone(&cart));
        if rank == 0 {
            u0.add(&[5], 1.0).unwrap();
            u1.add(&[5], 10.0).unwrap();
        } else {
            u0.add(&[0], 2.0).unwrap();
            u1.add(&[0], 20.0).unwrap();
        }
        let mut u = BlockVector::from_blocks(vec![u0, u1]).unwrap();
        u.update_ghost_regions().unwrap();
        let local = cart.global_to_local(&[5]).unwrap();
        (
            u.block(0).get(&local).unwrap(),
            u.block(1).get(&local).unwrap(),
        )
    });
    assert_eq!(results, vec![(3.0, 30.0), (3.0, 30.0)]);
}
