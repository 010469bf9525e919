use matfree::basis::Basis;
use matfree::error::Error;
use matfree::operator::{CompositeOperator, Operator, OperatorState, VectorSpec};
use matfree::qfunction::QFunction;
use matfree::restriction::ElemRestriction;
use matfree::vector::Vector;
use matfree::{Context, EvalMode};
use matrixcompare::assert_scalar_eq;
use std::sync::Arc;

fn host() -> Context {
    Context::init("host").unwrap()
}

/// A uniform `nx × nx` bilinear-quadrilateral mesh of the unit square.
///
/// Returns the element-to-node offsets (tensor ordering, x fastest), the
/// nodal coordinates as an L-vector with component planes, and the node
/// count.
fn unit_square_mesh(nx: usize) -> (Vec<usize>, Vector, usize) {
    let n = nx + 1;
    let num_nodes = n * n;
    let mut offsets = Vec::with_capacity(nx * nx * 4);
    for ey in 0..nx {
        for ex in 0..nx {
            for dy in 0..2 {
                for dx in 0..2 {
                    offsets.push((ey + dy) * n + (ex + dx));
                }
            }
        }
    }
    let mut coords = Vector::new(2 * num_nodes);
    {
        let values = coords.as_mut_slice();
        for j in 0..n {
            for i in 0..n {
                values[j * n + i] = i as f64 / nx as f64;
                values[num_nodes + j * n + i] = j as f64 / nx as f64;
            }
        }
    }
    (offsets, coords, num_nodes)
}

struct MassSetup {
    scalar_restriction: Arc<ElemRestriction>,
    scalar_basis: Arc<Basis>,
    qdata_restriction: Arc<ElemRestriction>,
    qdata: Arc<Vector>,
    num_nodes: usize,
}

/// Build the quadrature data for a mass operator on the unit square by
/// applying a setup operator to the mesh coordinates.
fn assemble_mass_setup(ctx: &Context, nx: usize) -> MassSetup {
    let (offsets, coords, num_nodes) = unit_square_mesh(nx);
    let num_elem = nx * nx;
    let num_qpts = 4;

    let coords_restriction = Arc::new(
        ElemRestriction::create(ctx, num_elem, 4, 2, num_nodes, 2 * num_nodes, &offsets).unwrap(),
    );
    let scalar_restriction =
        Arc::new(ElemRestriction::create(ctx, num_elem, 4, 1, 1, num_nodes, &offsets).unwrap());
    let qdata_restriction = Arc::new(
        ElemRestriction::create_strided_default(ctx, num_elem, num_qpts, 1, num_elem * num_qpts)
            .unwrap(),
    );

    let coords_basis = Arc::new(Basis::create_tensor_h1_lagrange(ctx, 2, 2, 2, 2).unwrap());
    let scalar_basis = Arc::new(Basis::create_tensor_h1_lagrange(ctx, 2, 1, 2, 2).unwrap());

    let qf_build = Arc::new(
        QFunction::create(ctx, "build_mass")
            .unwrap()
            .host_kernel(Box::new(|q, inputs, outputs| {
                let (jacobian, weights) = (inputs[0], inputs[1]);
                let qdata = &mut outputs[0];
                for i in 0..q {
                    let det = jacobian[i] * jacobian[3 * q + i]
                        - jacobian[q + i] * jacobian[2 * q + i];
                    qdata[i] = det * weights[i];
                }
                Ok(())
            }))
            .input("dx", 4, EvalMode::Grad)
            .unwrap()
            .input("weights", 1, EvalMode::Weight)
            .unwrap()
            .output("qdata", 1, EvalMode::None)
            .unwrap(),
    );

    let op_build = Operator::create(ctx, &qf_build).unwrap();
    op_build
        .set_field(
            "dx",
            Some(&coords_restriction),
            Some(&coords_basis),
            VectorSpec::Active,
        )
        .unwrap();
    op_build
        .set_field("weights", None, Some(&coords_basis), VectorSpec::None)
        .unwrap();
    op_build
        .set_field("qdata", Some(&qdata_restriction), None, VectorSpec::Active)
        .unwrap();

    let mut qdata = Vector::new(num_elem * num_qpts);
    op_build.apply(&coords, &mut qdata).unwrap();

    MassSetup {
        scalar_restriction,
        scalar_basis,
        qdata_restriction,
        qdata: Arc::new(qdata),
        num_nodes,
    }
}

fn mass_operator(ctx: &Context, setup: &MassSetup) -> Operator {
    let qf_mass = Arc::new(
        QFunction::create(ctx, "mass")
            .unwrap()
            .host_kernel(Box::new(|q, inputs, outputs| {
                let (u, qdata) = (inputs[0], inputs[1]);
                let v = &mut outputs[0];
                for i in 0..q {
                    v[i] = u[i] * qdata[i];
                }
                Ok(())
            }))
            .input("u", 1, EvalMode::Interp)
            .unwrap()
            .input("qdata", 1, EvalMode::None)
            .unwrap()
            .output("v", 1, EvalMode::Interp)
            .unwrap(),
    );

    let op = Operator::create(ctx, &qf_mass).unwrap();
    op.set_field(
        "u",
        Some(&setup.scalar_restriction),
        Some(&setup.scalar_basis),
        VectorSpec::Active,
    )
    .unwrap();
    op.set_field(
        "qdata",
        Some(&setup.qdata_restriction),
        None,
        VectorSpec::Fixed(Arc::clone(&setup.qdata)),
    )
    .unwrap();
    op.set_field(
        "v",
        Some(&setup.scalar_restriction),
        Some(&setup.scalar_basis),
        VectorSpec::Active,
    )
    .unwrap();
    op
}

#[test]
fn setup_operator_produces_the_jacobian_determinants() {
    let ctx = host();
    let setup = assemble_mass_setup(&ctx, 2);
    // Affine 0.5 x 0.5 elements mapped from [-1, 1]^2: det J = 1/16 at
    // every quadrature point, and the 2-point Gauss weights are one.
    for &value in setup.qdata.as_slice() {
        assert_scalar_eq!(value, 1.0 / 16.0, comp = abs, tol = 1e-13);
    }
}

#[test]
fn mass_applied_to_ones_integrates_the_domain_area() {
    let ctx = host();
    let setup = assemble_mass_setup(&ctx, 2);
    let op = mass_operator(&ctx, &setup);

    let mut u = Vector::new(setup.num_nodes);
    u.set_value(1.0);
    let mut v = Vector::new(setup.num_nodes);
    op.apply(&u, &mut v).unwrap();

    let total: f64 = v.as_slice().iter().sum();
    assert_scalar_eq!(total, 1.0, comp = abs, tol = 1e-12);

    // Row sums of the mass matrix: corner, edge and interior nodes collect
    // contributions from 1, 2 and 4 elements respectively.
    let values = v.as_slice();
    assert_scalar_eq!(values[0], 1.0 / 16.0, comp = abs, tol = 1e-13);
    assert_scalar_eq!(values[1], 2.0 / 16.0, comp = abs, tol = 1e-13);
    assert_scalar_eq!(values[4], 4.0 / 16.0, comp = abs, tol = 1e-13);
}

#[test]
fn apply_add_accumulates_into_the_output() {
    let ctx = host();
    let setup = assemble_mass_setup(&ctx, 2);
    let op = mass_operator(&ctx, &setup);

    let mut u = Vector::new(setup.num_nodes);
    u.set_value(1.0);
    let mut v = Vector::new(setup.num_nodes);
    op.apply(&u, &mut v).unwrap();
    let first: Vec<f64> = v.as_slice().to_vec();

    op.apply_add(&u, &mut v).unwrap();
    for (twice, once) in v.as_slice().iter().zip(&first) {
        assert_scalar_eq!(*twice, 2.0 * once, comp = abs, tol = 1e-13);
    }
}

#[test]
fn operator_walks_the_state_machine() {
    let ctx = host();
    let setup = assemble_mass_setup(&ctx, 2);
    let op = mass_operator(&ctx, &setup);
    assert_eq!(op.state(), OperatorState::Unbuilt);

    op.build().unwrap();
    assert_eq!(op.state(), OperatorState::Built);

    // Rebinding before compilation reopens the operator.
    op.set_field(
        "u",
        Some(&setup.scalar_restriction),
        Some(&setup.scalar_basis),
        VectorSpec::Active,
    )
    .unwrap();
    assert_eq!(op.state(), OperatorState::Unbuilt);

    let mut u = Vector::new(setup.num_nodes);
    u.set_value(1.0);
    let mut v = Vector::new(setup.num_nodes);
    op.apply(&u, &mut v).unwrap();
    assert_eq!(op.state(), OperatorState::Compiled);
}

#[test]
fn bindings_are_frozen_after_compilation() {
    let ctx = host();
    let setup = assemble_mass_setup(&ctx, 2);
    let op = mass_operator(&ctx, &setup);

    let mut u = Vector::new(setup.num_nodes);
    u.set_value(1.0);
    let mut v = Vector::new(setup.num_nodes);
    op.apply(&u, &mut v).unwrap();

    let result = op.set_field(
        "u",
        Some(&setup.scalar_restriction),
        Some(&setup.scalar_basis),
        VectorSpec::Active,
    );
    assert!(matches!(result, Err(Error::OperatorFrozen { .. })));
}

#[test]
fn unbound_fields_are_reported_by_name() {
    let ctx = host();
    let setup = assemble_mass_setup(&ctx, 2);
    let op = mass_operator(&ctx, &setup);
    // Rebind a name the QFunction never declared.
    op.set_field(
        "unknown",
        Some(&setup.scalar_restriction),
        Some(&setup.scalar_basis),
        VectorSpec::Active,
    )
    .unwrap();
    assert!(matches!(op.build(), Err(Error::FieldSetMismatch { .. })));
}

#[test]
fn a_second_active_input_is_rejected() {
    let ctx = host();
    let setup = assemble_mass_setup(&ctx, 2);
    let op = mass_operator(&ctx, &setup);
    op.set_field(
        "qdata",
        Some(&setup.qdata_restriction),
        None,
        VectorSpec::Active,
    )
    .unwrap();
    assert!(matches!(op.build(), Err(Error::InvalidField { .. })));
}

#[test]
fn composite_operator_sums_sub_operators() {
    let ctx = host();
    let setup = assemble_mass_setup(&ctx, 2);
    let single = mass_operator(&ctx, &setup);

    let composite = CompositeOperator::create(vec![
        Arc::new(mass_operator(&ctx, &setup)),
        Arc::new(mass_operator(&ctx, &setup)),
    ])
    .unwrap();

    let mut u = Vector::new(setup.num_nodes);
    u.set_value(1.0);
    let mut v_single = Vector::new(setup.num_nodes);
    single.apply(&u, &mut v_single).unwrap();
    let mut v_sum = Vector::new(setup.num_nodes);
    composite.apply(&u, &mut v_sum).unwrap();

    for (sum, once) in v_sum.as_slice().iter().zip(v_single.as_slice()) {
        assert_scalar_eq!(*sum, 2.0 * once, comp = abs, tol = 1e-13);
    }
}

#[test]
fn weight_fields_reject_a_restriction() {
    let ctx = host();
    let setup = assemble_mass_setup(&ctx, 2);
    let qf = Arc::new(
        QFunction::create(&ctx, "weighted")
            .unwrap()
            .host_kernel(Box::new(|q, inputs, outputs| {
                for i in 0..q {
                    outputs[0][i] = inputs[0][i];
                }
                Ok(())
            }))
            .input("w", 1, EvalMode::Weight)
            .unwrap()
            .output("v", 1, EvalMode::Interp)
            .unwrap(),
    );
    let op = Operator::create(&ctx, &qf).unwrap();
    op.set_field(
        "w",
        Some(&setup.scalar_restriction),
        Some(&setup.scalar_basis),
        VectorSpec::None,
    )
    .unwrap();
    op.set_field(
        "v",
        Some(&setup.scalar_restriction),
        Some(&setup.scalar_basis),
        VectorSpec::Active,
    )
    .unwrap();
    assert!(matches!(op.build(), Err(Error::InvalidField { .. })));
}
