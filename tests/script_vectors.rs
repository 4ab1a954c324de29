
use bitcoin::{
    absolute::LockTime, consensus, hashes::Hash, transaction::Version, Amount, OutPoint, ScriptBuf,
    Sequence, Transaction, TxIn, TxOut, Txid, Witness,
};
use script_asm::parse_script;
use serde_json::Value;
use txscript::{verify_with_flags_detailed, ScriptError, ScriptFailure, ScriptFlags};

const SCRIPT_VALID: &str = include_str!("data/script_valid.json");
const SCRIPT_INVALID: &str = include_str!("data/script_invalid.json");

const VALID_VECTORS: usize = 819;
const INVALID_VECTORS: usize = 402;

/// Output-creating transaction the spend points at.
fn build_crediting_tx(script_pubkey: &[u8]) -> Transaction {
    Transaction {
        version: Version(1),
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint {
                txid: Txid::all_zeros(),
                vout: u32::MAX,
            },
            script_sig: ScriptBuf::from_bytes(vec![0x00, 0x00]),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value: Amount::ZERO,
            script_pubkey: ScriptBuf::from_bytes(script_pubkey.to_vec()),
        }],
    }
}

fn build_spending_tx(script_sig: &[u8], credit: &Transaction) -> Transaction {
    Transaction {
        version: Version(1),
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint {
                txid: credit.compute_txid(),
                vout: 0,
            },
            script_sig: ScriptBuf::from_bytes(script_sig.to_vec()),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value: Amount::ZERO,
            script_pubkey: ScriptBuf::new(),
        }],
    }
}

fn run_vector_case(script_sig: &[u8], script_pubkey: &[u8], flags: u32) -> Result<(), ScriptFailure> {
    let credit = build_crediting_tx(script_pubkey);
    let spend = build_spending_tx(script_sig, &credit);
    let tx_bytes = consensus::serialize(&spend);
    verify_with_flags_detailed(script_pubkey, &tx_bytes, 0, flags)
}

struct Vector<'a> {
    index: usize,
    script_sig: &'a str,
    script_pubkey: &'a str,
    flags: ScriptFlags,
    rest: &'a [Value],
}

fn load(raw: &str) -> Vec<Value> {
    serde_json::from_str(raw).expect("fixture deserializes")
}

/// Every non-comment row of a fixture, in file order.
///
/// A row is either a comment (exactly one string) or a vector of at least
/// four strings; any other shape fails the test instead of being skipped.
fn vectors(tests: &[Value]) -> Vec<Vector<'_>> {
    let mut vectors = Vec::new();
    for (index, test) in tests.iter().enumerate() {
        let arr = test
            .as_array()
            .unwrap_or_else(|| panic!("entry #{index} is not an array"));
        let field = |i: usize| {
            arr[i]
                .as_str()
                .unwrap_or_else(|| panic!("entry #{index} field {i} is not a string"))
        };
        match arr.len() {
            1 => {
                field(0);
            }
            len if len >= 4 => {
                let flags_str = field(2);
                let flags = flags_str
                    .parse()
                    .unwrap_or_else(|err| panic!("entry #{index} invalid flags `{flags_str}`: {err}"));
                vectors.push(Vector {
                    index,
                    script_sig: field(0),
                    script_pubkey: field(1),
                    flags,
                    rest: &arr[3..],
                });
            }
            len => panic!("entry #{index} has {len} fields"),
        }
    }
    vectors
}

fn assemble(vector: &Vector<'_>) -> (Vec<u8>, Vec<u8>) {
    let script_sig = parse_script(vector.script_sig)
        .unwrap_or_else(|err| panic!("vector #{} bad scriptSig: {err}", vector.index));
    let script_pubkey = parse_script(vector.script_pubkey)
        .unwrap_or_else(|err| panic!("vector #{} bad scriptPubKey: {err}", vector.index));
    (script_sig, script_pubkey)
}

#[test]
fn valid_script_vectors() {
    let tests = load(SCRIPT_VALID);
    let mut count = 0usize;

    for vector in vectors(&tests) {
        let (script_sig, script_pubkey) = assemble(&vector);
        if let Err(failure) = run_vector_case(&script_sig, &script_pubkey, vector.flags.bits()) {
            panic!(
                "vector #{} expected OK but failed with {:?} flags={} scriptSig=`{}` scriptPubKey=`{}`",
                vector.index, failure.script_error, vector.flags, vector.script_sig, vector.script_pubkey
            );
        }
        count += 1;
    }

    assert_eq!(count, VALID_VECTORS, "valid vectors checked");
}

#[test]
fn invalid_script_vectors() {
    let tests = load(SCRIPT_INVALID);
    let mut count = 0usize;

    for vector in vectors(&tests) {
        let expected = vector.rest[0]
            .as_str()
            .unwrap_or_else(|| panic!("vector #{} has no expected error", vector.index));
        let (script_sig, script_pubkey) = assemble(&vector);

        let failure = run_vector_case(&script_sig, &script_pubkey, vector.flags.bits())
            .expect_err(&format!("vector #{} expected {expected} but succeeded", vector.index));
        let actual = failure.script_error.map(ScriptError::code);
        assert_eq!(
            actual,
            Some(expected),
            "vector #{} flags={} scriptSig=`{}` scriptPubKey=`{}`",
            vector.index,
            vector.flags,
            vector.script_sig,
            vector.script_pubkey
        );
        count += 1;
    }

    assert_eq!(count, INVALID_VECTORS, "invalid vectors checked");
}

#[test]
fn invalid_vectors_cover_every_error_code() {
    let tests = load(SCRIPT_INVALID);
    let vectors = vectors(&tests);
    let seen: Vec<&str> = vectors
        .iter()
        .map(|vector| {
            vector.rest[0]
                .as_str()
                .unwrap_or_else(|| panic!("vector #{} has no expected error", vector.index))
        })
        .collect();

    for code in [
        "UNKNOWN_ERROR",
        "EVAL_FALSE",
        "OP_RETURN",
        "SCRIPT_SIZE",
        "PUSH_SIZE",
        "OP_COUNT",
        "STACK_SIZE",
        "SIG_COUNT",
        "PUBKEY_COUNT",
        "VERIFY",
        "EQUALVERIFY",
        "CHECKSIGVERIFY",
        "CHECKMULTISIGVERIFY",
        "NUMEQUALVERIFY",
        "BAD_OPCODE",
        "DISABLED_OPCODE",
        "INVALID_STACK_OPERATION",
        "INVALID_ALTSTACK_OPERATION",
        "UNBALANCED_CONDITIONAL",
        "NEGATIVE_LOCKTIME",
        "UNSATISFIED_LOCKTIME",
        "SIG_HASHTYPE",
        "SIG_DER",
        "MINIMALDATA",
        "SIG_PUSHONLY",
        "SIG_HIGH_S",
        "SIG_NULLDUMMY",
        "PUBKEYTYPE",
        "DISCOURAGE_UPGRADABLE_NOPS",
    ] {
        assert!(seen.contains(&code), "no invalid vector expects {code}");
    }
}
