use matfree::tensor::{contract, contract_blocked, contract_serial};
use matfree::TransposeMode;

fn identity(n: usize) -> Vec<f64> {
    let mut t = vec![0.0; n * n];
    for i in 0..n {
        t[i * n + i] = 1.0;
    }
    t
}

#[test]
fn identity_table_reproduces_operand() {
    let u: Vec<f64> = (0..2 * 3 * 2).map(|i| i as f64).collect();
    let t = identity(3);
    let mut v = vec![7.0; u.len()];
    contract(2, 3, 2, 3, &t, TransposeMode::NoTranspose, false, &u, &mut v);
    assert_eq!(v, u);
}

#[test]
fn add_flag_accumulates_onto_destination() {
    let u: Vec<f64> = (0..6).map(|i| i as f64).collect();
    let t = identity(3);
    let mut v = vec![1.0; 6];
    contract(2, 3, 1, 3, &t, TransposeMode::NoTranspose, true, &u, &mut v);
    let expected: Vec<f64> = u.iter().map(|x| x + 1.0).collect();
    assert_eq!(v, expected);
}

#[test]
fn blocked_and_serial_strategies_are_bit_identical() {
    // Both strategies apply for a unit trailing extent; their results must
    // agree bit for bit so either can serve as a regression baseline.
    let (a, b, c, j) = (2, 3, 1, 4);
    let t: Vec<f64> = (0..b * j).map(|i| 0.37 * (i as f64) - 1.0).collect();
    let u: Vec<f64> = (0..a * b * c).map(|i| 1.0 / (1.0 + i as f64)).collect();

    let mut v_blocked = vec![0.0; a * j * c];
    contract_blocked(a, b, c, j, &t, TransposeMode::NoTranspose, &u, &mut v_blocked);
    let mut v_serial = vec![0.0; a * j * c];
    contract_serial(a, b, c, j, &t, TransposeMode::NoTranspose, &u, &mut v_serial);

    let blocked_bits: Vec<u64> = v_blocked.iter().map(|x| x.to_bits()).collect();
    let serial_bits: Vec<u64> = v_serial.iter().map(|x| x.to_bits()).collect();
    assert_eq!(blocked_bits, serial_bits);
}

#[test]
fn repeated_evaluation_is_bit_reproducible() {
    let (a, b, c, j) = (3, 4, 5, 2);
    let t: Vec<f64> = (0..b * j).map(|i| (i as f64).sin()).collect();
    let u: Vec<f64> = (0..a * b * c).map(|i| (i as f64).cos()).collect();

    let mut first = vec![0.0; a * j * c];
    contract(a, b, c, j, &t, TransposeMode::NoTranspose, false, &u, &mut first);
    let mut second = vec![0.0; a * j * c];
    contract(a, b, c, j, &t, TransposeMode::NoTranspose, false, &u, &mut second);

    let first_bits: Vec<u64> = first.iter().map(|x| x.to_bits()).collect();
    let second_bits: Vec<u64> = second.iter().map(|x| x.to_bits()).collect();
    assert_eq!(first_bits, second_bits);
}

#[test]
fn contraction_matches_naive_triple_loop() {
    let (a, b, c, j) = (2, 4, 3, 5);
    let t: Vec<f64> = (0..b * j).map(|i| 0.1 * i as f64).collect();
    let u: Vec<f64> = (0..a * b * c).map(|i| 1.0 - 0.05 * i as f64).collect();

    let mut v = vec![0.0; a * j * c];
    contract(a, b, c, j, &t, TransposeMode::NoTranspose, false, &u, &mut v);

    for ia in 0..a {
        for ij in 0..j {
            for ic in 0..c {
                let mut expected = 0.0;
                for ib in 0..b {
                    expected += t[ij * b + ib] * u[(ia * b + ib) * c + ic];
                }
                assert_eq!(v[(ia * j + ij) * c + ic], expected);
            }
        }
    }
}

#[test]
fn transpose_contraction_matches_naive_triple_loop() {
    // t stored as a 4 x 5 table, contracted through its transpose.
    let (a, b, c, j) = (2, 4, 3, 5);
    let t: Vec<f64> = (0..b * j).map(|i| 0.3 * i as f64 - 1.0).collect();
    let u: Vec<f64> = (0..a * b * c).map(|i| 0.01 * (i * i) as f64).collect();

    let mut v = vec![0.0; a * j * c];
    contract(a, b, c, j, &t, TransposeMode::Transpose, false, &u, &mut v);

    for ia in 0..a {
        for ij in 0..j {
            for ic in 0..c {
                let mut expected = 0.0;
                for ib in 0..b {
                    expected += t[ib * j + ij] * u[(ia * b + ib) * c + ic];
                }
                assert_eq!(v[(ia * j + ij) * c + ic], expected);
            }
        }
    }
}
