use matfree::error::Error;
use matfree::restriction::ElemRestriction;
use matfree::vector::Vector;
use matfree::{Context, TransposeMode};
use proptest::collection::vec;
use proptest::prelude::*;

fn host() -> Context {
    Context::init("host").unwrap()
}

#[test]
fn strided_round_trip_single_element() {
    let ctx = host();
    let r = ElemRestriction::create_strided_default(&ctx, 1, 4, 1, 4).unwrap();
    let u = Vector::from_slice(&[1.0, 2.0, 3.0, 4.0]);

    let mut e = r.create_evector();
    r.apply(TransposeMode::NoTranspose, &u, &mut e).unwrap();
    assert_eq!(e.as_slice(), u.as_slice());

    // No node is shared, so the transpose recovers the input exactly.
    let mut back = r.create_lvector();
    r.apply(TransposeMode::Transpose, &e, &mut back).unwrap();
    assert_eq!(back.as_slice(), u.as_slice());
}

#[test]
fn offsets_gather_duplicates_shared_node() {
    // Two 1D line elements sharing the middle node.
    let ctx = host();
    let r = ElemRestriction::create(&ctx, 2, 2, 1, 1, 3, &[0, 1, 1, 2]).unwrap();
    let u = Vector::from_slice(&[10.0, 20.0, 30.0]);

    let mut e = r.create_evector();
    r.apply(TransposeMode::NoTranspose, &u, &mut e).unwrap();
    assert_eq!(e.as_slice(), &[10.0, 20.0, 20.0, 30.0]);
}

#[test]
fn scatter_of_ones_counts_multiplicity() {
    let ctx = host();
    let r = ElemRestriction::create(&ctx, 2, 2, 1, 1, 3, &[0, 1, 1, 2]).unwrap();

    let mut ones = r.create_evector();
    ones.set_value(1.0);
    let mut counts = r.create_lvector();
    r.apply(TransposeMode::Transpose, &ones, &mut counts).unwrap();
    // The shared node receives one contribution per adjacent element.
    assert_eq!(counts.as_slice(), &[1.0, 2.0, 1.0]);

    let mult = r.multiplicity().unwrap();
    assert_eq!(mult.as_slice(), &[1.0, 2.0, 1.0]);
}

#[test]
fn transpose_accumulates_instead_of_overwriting() {
    let ctx = host();
    let r = ElemRestriction::create(&ctx, 2, 2, 1, 1, 3, &[0, 1, 1, 2]).unwrap();
    let mut ones = r.create_evector();
    ones.set_value(1.0);
    let mut l = Vector::from_slice(&[5.0, 5.0, 5.0]);
    r.apply(TransposeMode::Transpose, &ones, &mut l).unwrap();
    assert_eq!(l.as_slice(), &[6.0, 7.0, 6.0]);
}

#[test]
fn orientation_flip_is_self_inverse() {
    let ctx = host();
    let offsets = [0, 1, 1, 2];
    let plain = ElemRestriction::create(&ctx, 2, 2, 1, 1, 3, &offsets).unwrap();
    let flipped =
        ElemRestriction::create_oriented(&ctx, 2, 2, 1, 1, 3, &offsets, &[true; 4]).unwrap();
    let u = Vector::from_slice(&[1.0, -2.0, 3.0]);

    // Gather-then-scatter through the all-flipped restriction...
    let mut e = flipped.create_evector();
    flipped.apply(TransposeMode::NoTranspose, &u, &mut e).unwrap();
    let mut through_flipped = flipped.create_lvector();
    flipped
        .apply(TransposeMode::Transpose, &e, &mut through_flipped)
        .unwrap();

    // ...equals negate, gather, scatter, negate through the plain one.
    let minus_u = Vector::from_slice(&[-1.0, 2.0, -3.0]);
    let mut e = plain.create_evector();
    plain
        .apply(TransposeMode::NoTranspose, &minus_u, &mut e)
        .unwrap();
    let mut through_plain = plain.create_lvector();
    plain
        .apply(TransposeMode::Transpose, &e, &mut through_plain)
        .unwrap();
    let negated: Vec<f64> = through_plain.as_slice().iter().map(|x| -x).collect();

    assert_eq!(through_flipped.as_slice(), negated.as_slice());
}

#[test]
fn oriented_gather_flips_marked_entries() {
    let ctx = host();
    let r = ElemRestriction::create_oriented(
        &ctx,
        2,
        2,
        1,
        1,
        3,
        &[0, 1, 1, 2],
        &[false, true, false, false],
    )
    .unwrap();
    let u = Vector::from_slice(&[1.0, 2.0, 3.0]);
    let mut e = r.create_evector();
    r.apply(TransposeMode::NoTranspose, &u, &mut e).unwrap();
    assert_eq!(e.as_slice(), &[1.0, -2.0, 2.0, 3.0]);
}

#[test]
fn multi_component_gather_uses_component_stride() {
    // Two components stored as separate planes of the L-vector.
    let ctx = host();
    let r = ElemRestriction::create(&ctx, 1, 2, 2, 3, 6, &[0, 2]).unwrap();
    let u = Vector::from_slice(&[1.0, 2.0, 3.0, 10.0, 20.0, 30.0]);
    let mut e = r.create_evector();
    r.apply(TransposeMode::NoTranspose, &u, &mut e).unwrap();
    // E-layout is [elem][comp][node].
    assert_eq!(e.as_slice(), &[1.0, 3.0, 10.0, 30.0]);
}

#[test]
fn out_of_bounds_offset_is_rejected_at_creation() {
    let ctx = host();
    let result = ElemRestriction::create(&ctx, 2, 2, 1, 1, 3, &[0, 1, 1, 3]);
    assert!(matches!(result, Err(Error::OffsetOutOfBounds { .. })));

    // The last component of the last node must also stay in bounds.
    let result = ElemRestriction::create(&ctx, 1, 2, 2, 3, 5, &[0, 2]);
    assert!(matches!(result, Err(Error::OffsetOutOfBounds { .. })));
}

#[test]
fn wrong_offets_length_is_rejected() {
    let ctx = host();
    let result = ElemRestriction::create(&ctx, 2, 2, 1, 1, 3, &[0, 1, 1]);
    assert!(matches!(result, Err(Error::LengthMismatch { .. })));
}

#[test]
fn apply_checks_vector_lengths() {
    let ctx = host();
    let r = ElemRestriction::create(&ctx, 2, 2, 1, 1, 3, &[0, 1, 1, 2]).unwrap();
    let u = Vector::new(2);
    let mut e = r.create_evector();
    assert!(matches!(
        r.apply(TransposeMode::NoTranspose, &u, &mut e),
        Err(Error::LengthMismatch { .. })
    ));
}

#[derive(Debug)]
struct GatherArgs {
    num_elem: usize,
    elem_size: usize,
    l_size: usize,
    offsets: Vec<usize>,
    u: Vec<f64>,
}

fn gather_args() -> impl Strategy<Value = GatherArgs> {
    (1..4usize, 1..4usize, 1..8usize)
        .prop_flat_map(|(num_elem, elem_size, l_size)| {
            let offsets = vec(0..l_size, num_elem * elem_size);
            let u = vec(-100.0..100.0f64, l_size);
            (Just(num_elem), Just(elem_size), Just(l_size), offsets, u)
        })
        .prop_map(|(num_elem, elem_size, l_size, offsets, u)| GatherArgs {
            num_elem,
            elem_size,
            l_size,
            offsets,
            u,
        })
}

proptest! {
    #[test]
    fn gather_matches_naive_indexing(args in gather_args()) {
        let ctx = host();
        let r = ElemRestriction::create(
            &ctx, args.num_elem, args.elem_size, 1, 1, args.l_size, &args.offsets,
        ).unwrap();
        let u = Vector::from_slice(&args.u);
        let mut e = r.create_evector();
        r.apply(TransposeMode::NoTranspose, &u, &mut e).unwrap();

        let mut all_correct = true;
        for elem in 0..args.num_elem {
            for node in 0..args.elem_size {
                let expected = args.u[args.offsets[elem * args.elem_size + node]];
                if e.as_slice()[elem * args.elem_size + node] != expected {
                    all_correct = false;
                }
            }
        }
        prop_assert!(all_correct);
    }

    #[test]
    fn scatter_of_ones_matches_occurrence_counts(args in gather_args()) {
        let ctx = host();
        let r = ElemRestriction::create(
            &ctx, args.num_elem, args.elem_size, 1, 1, args.l_size, &args.offsets,
        ).unwrap();
        let mult = r.multiplicity().unwrap();

        let mut counts = vec![0.0; args.l_size];
        for &offset in &args.offsets {
            counts[offset] += 1.0;
        }
        prop_assert_eq!(mult.as_slice(), counts.as_slice());
    }
}
