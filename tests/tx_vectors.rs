
use bitcoin::{consensus, hex::FromHex, OutPoint, Transaction, Txid};
use script_asm::parse_script;
use serde_json::Value;
use std::{collections::HashMap, str::FromStr};
use txscript::{verify_with_flags, Error, ScriptFlags};

const TX_VALID: &str = include_str!("data/tx_valid.json");
const TX_INVALID: &str = include_str!("data/tx_invalid.json");

const VALID_VECTORS: usize = 23;
const INVALID_VECTORS: usize = 22;

struct TxVector {
    index: usize,
    prevouts: HashMap<OutPoint, Vec<u8>>,
    tx_bytes: Vec<u8>,
    flags: ScriptFlags,
}

fn parse_prevouts(index: usize, entries: &[Value]) -> HashMap<OutPoint, Vec<u8>> {
    entries
        .iter()
        .map(|entry| {
            let fields = entry
                .as_array()
                .filter(|fields| fields.len() == 3)
                .unwrap_or_else(|| panic!("entry #{index} has a malformed prevout"));
            let txid = fields[0]
                .as_str()
                .and_then(|hex| Txid::from_str(hex).ok())
                .unwrap_or_else(|| panic!("entry #{index} has a bad prevout hash"));
            let vout = fields[1]
                .as_i64()
                .unwrap_or_else(|| panic!("entry #{index} has a bad prevout index"));
            let asm = fields[2]
                .as_str()
                .unwrap_or_else(|| panic!("entry #{index} has no prevout script"));
            let script = parse_script(asm)
                .unwrap_or_else(|err| panic!("entry #{index} bad prevout script: {err}"));
            (OutPoint::new(txid, vout as u32), script)
        })
        .collect()
}

/// Every non-comment row of a fixture, in file order.
///
/// Comments are single-string rows; anything that is neither a comment nor
/// `[prevouts, tx_hex, flags]` fails the test.
fn vectors(raw: &str) -> Vec<TxVector> {
    let tests: Vec<Value> = serde_json::from_str(raw).expect("fixture deserializes");
    let mut vectors = Vec::new();
    for (index, test) in tests.iter().enumerate() {
        let arr = test
            .as_array()
            .unwrap_or_else(|| panic!("entry #{index} is not an array"));
        match arr.as_slice() {
            [Value::String(_)] => continue,
            [Value::Array(prevouts), Value::String(tx_hex), Value::String(flags)] => {
                vectors.push(TxVector {
                    index,
                    prevouts: parse_prevouts(index, prevouts),
                    tx_bytes: Vec::from_hex(tx_hex)
                        .unwrap_or_else(|_| panic!("entry #{index} has bad transaction hex")),
                    flags: flags.parse().unwrap_or_else(|err| {
                        panic!("entry #{index} invalid flags `{flags}`: {err}")
                    }),
                });
            }
            _ => panic!("entry #{index} is neither a comment nor a vector"),
        }
    }
    vectors
}

/// Runs every input of the vector's transaction and returns the first failure.
fn check_inputs(vector: &TxVector) -> Result<(), (usize, Error)> {
    // Decode leniently so the verifier sees trailing bytes itself.
    let (tx, _): (Transaction, usize) = match consensus::deserialize_partial(&vector.tx_bytes) {
        Ok(decoded) => decoded,
        Err(_) => return Err((0, Error::ERR_TX_DESERIALIZE)),
    };
    for (input_index, input) in tx.input.iter().enumerate() {
        let script_pubkey = vector
            .prevouts
            .get(&input.previous_output)
            .unwrap_or_else(|| panic!("entry #{} misses prevout {}", vector.index, input.previous_output));
        verify_with_flags(script_pubkey, &vector.tx_bytes, input_index, vector.flags.bits())
            .map_err(|err| (input_index, err))?;
    }
    Ok(())
}

#[test]
fn valid_transactions() {
    let vectors = vectors(TX_VALID);
    assert_eq!(vectors.len(), VALID_VECTORS);
    for vector in &vectors {
        if let Err((input, err)) = check_inputs(vector) {
            panic!(
                "entry #{} input {input} failed with {err:?} under {}",
                vector.index, vector.flags
            );
        }
    }
}

#[test]
fn invalid_transactions() {
    let vectors = vectors(TX_INVALID);
    assert_eq!(vectors.len(), INVALID_VECTORS);
    for vector in &vectors {
        assert!(
            check_inputs(vector).is_err(),
            "entry #{} unexpectedly verified under {}",
            vector.index,
            vector.flags
        );
    }
}

#[test]
fn failing_input_is_reported_by_index() {
    let vectors = vectors(TX_INVALID);
    let two_inputs = vectors
        .iter()
        .find(|vector| vector.prevouts.len() == 2)
        .expect("a two-input vector");
    assert_eq!(check_inputs(two_inputs), Err((1, Error::ERR_SCRIPT)));
}

#[test]
fn trailing_bytes_are_a_size_mismatch() {
    let vectors = vectors(TX_INVALID);
    let last = vectors.last().expect("vectors present");
    assert_eq!(check_inputs(last), Err((0, Error::ERR_TX_SIZE_MISMATCH)));
}
