use matfree::error::Error;
use matfree::qfunction::QFunction;
use matfree::{Context, EvalMode};
use matrixcompare::assert_scalar_eq;

fn host() -> Context {
    Context::init("host").unwrap()
}

fn mass_qfunction(ctx: &Context) -> QFunction {
    QFunction::create(ctx, "mass")
        .unwrap()
        .host_kernel(Box::new(|q, inputs, outputs| {
            let (u, w) = (inputs[0], inputs[1]);
            let v = &mut outputs[0];
            for i in 0..q {
                v[i] = u[i] * w[i];
            }
            Ok(())
        }))
        .input("u", 1, EvalMode::Interp)
        .unwrap()
        .input("w", 1, EvalMode::Weight)
        .unwrap()
        .output("v", 1, EvalMode::Interp)
        .unwrap()
}

#[test]
fn host_kernel_evaluates_pointwise() {
    let ctx = host();
    let qf = mass_qfunction(&ctx);

    let u = [1.0, 2.0, 3.0, 4.0];
    let w = [0.5, 0.5, 2.0, 2.0];
    let mut v = [0.0; 4];
    qf.apply(4, &[&u, &w], &mut [&mut v]).unwrap();
    for (actual, expected) in v.iter().zip(&[0.5, 1.0, 6.0, 8.0]) {
        assert_scalar_eq!(*actual, *expected, comp = abs, tol = 1e-15);
    }
}

#[test]
fn field_sizes_are_validated_on_apply() {
    let ctx = host();
    let qf = mass_qfunction(&ctx);
    let u = [1.0, 2.0];
    // Three weight entries for two quadrature points.
    let w = [1.0, 1.0, 1.0];
    let mut v = [0.0; 2];
    let result = qf.apply(2, &[&u, &w], &mut [&mut v]);
    assert!(matches!(result, Err(Error::LengthMismatch { .. })));
}

#[test]
fn multi_component_fields_use_quadrature_major_layout() {
    let ctx = host();
    let qf = QFunction::create(&ctx, "sum_components")
        .unwrap()
        .host_kernel(Box::new(|q, inputs, outputs| {
            let u = inputs[0];
            let v = &mut outputs[0];
            for i in 0..q {
                v[i] = u[i] + u[q + i];
            }
            Ok(())
        }))
        .input("u", 2, EvalMode::Interp)
        .unwrap()
        .output("v", 1, EvalMode::Interp)
        .unwrap();

    // Two points, two components: [u0(q0), u0(q1), u1(q0), u1(q1)].
    let u = [1.0, 2.0, 10.0, 20.0];
    let mut v = [0.0; 2];
    qf.apply(2, &[&u], &mut [&mut v]).unwrap();
    assert_eq!(v, [11.0, 22.0]);
}

#[test]
fn weight_fields_must_have_unit_size() {
    let ctx = host();
    let result = QFunction::create(&ctx, "bad")
        .unwrap()
        .input("w", 2, EvalMode::Weight);
    assert!(matches!(result, Err(Error::InvalidField { .. })));
}

#[test]
fn weights_cannot_be_outputs() {
    let ctx = host();
    let result = QFunction::create(&ctx, "bad")
        .unwrap()
        .output("w", 1, EvalMode::Weight);
    assert!(matches!(result, Err(Error::InvalidField { .. })));
}

#[test]
fn duplicate_field_names_are_rejected() {
    let ctx = host();
    let result = QFunction::create(&ctx, "dup")
        .unwrap()
        .input("u", 1, EvalMode::Interp)
        .unwrap()
        .output("u", 1, EvalMode::Interp);
    assert!(matches!(result, Err(Error::InvalidField { .. })));
}

#[test]
fn building_without_a_host_kernel_fails_on_the_host_backend() {
    let ctx = host();
    let qf = QFunction::create(&ctx, "sourceless")
        .unwrap()
        .input("u", 1, EvalMode::Interp)
        .unwrap()
        .output("v", 1, EvalMode::Interp)
        .unwrap();
    assert!(matches!(qf.build(), Err(Error::MissingKernel { .. })));
}

#[test]
fn kernel_errors_carry_the_qfunction_name() {
    let ctx = host();
    let qf = QFunction::create(&ctx, "fails")
        .unwrap()
        .host_kernel(Box::new(|_, _, _| Err("negative density".to_string())))
        .input("u", 1, EvalMode::Interp)
        .unwrap()
        .output("v", 1, EvalMode::Interp)
        .unwrap();
    let u = [1.0];
    let mut v = [0.0];
    match qf.apply(1, &[&u], &mut [&mut v]) {
        Err(Error::KernelFailure { name, message }) => {
            assert_eq!(name, "fails");
            assert_eq!(message, "negative density");
        }
        other => panic!("expected a kernel failure, got {:?}", other.map(|_| ())),
    }
}
