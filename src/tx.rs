//! Transaction decoding for the byte-level entry points.

use bitcoin::{consensus, Transaction};

use crate::{script::Script, signature::TransactionSignatureChecker, Error};

/// A spending transaction decoded from wire bytes.
#[derive(Debug, Clone)]
pub struct TransactionContext {
    tx: Transaction,
}

impl TransactionContext {
    /// Decodes `tx_bytes`, which must hold exactly one transaction.
    pub fn parse(tx_bytes: &[u8]) -> Result<Self, Error> {
        let (tx, consumed): (Transaction, usize) =
            consensus::deserialize_partial(tx_bytes).map_err(|_| Error::ERR_TX_DESERIALIZE)?;
        if consumed != tx_bytes.len() {
            return Err(Error::ERR_TX_SIZE_MISMATCH);
        }
        Ok(Self { tx })
    }

    pub fn tx(&self) -> &Transaction {
        &self.tx
    }

    pub fn ensure_input_index(&self, input_index: usize) -> Result<(), Error> {
        if input_index >= self.tx.input.len() {
            Err(Error::ERR_TX_INDEX)
        } else {
            Ok(())
        }
    }

    /// Raw scriptSig of an input, if the index exists.
    pub fn script_sig(&self, input_index: usize) -> Option<&[u8]> {
        self.tx
            .input
            .get(input_index)
            .map(|input| input.script_sig.as_bytes())
    }

    pub fn checker(&self, input_index: usize) -> TransactionSignatureChecker<'_> {
        TransactionSignatureChecker::new(&self.tx, input_index)
    }

    /// The scriptSig of an input as a parsed [`Script`].
    pub fn parsed_script_sig(&self, input_index: usize) -> Option<Script> {
        self.script_sig(input_index)
            .and_then(|bytes| Script::from_bytes(bytes).ok())
    }
}
