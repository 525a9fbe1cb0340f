//! Coinbase construction around the extranonce split.
//!
//! The pool serialises each job's coinbase transaction once, with a
//! placeholder where the extranonce bytes go, and hands miners the two
//! halves (`coinb1`/`coinb2`). Reassembling
//! `coinb1 || extranonce1 || extranonce2 || coinb2` yields the exact full
//! serialisation. The txid is always computed over the witness-stripped
//! form; for SegWit templates the full form carries the marker/flag bytes
//! and a single 32-zero-byte witness stack item.
//!
//! ScriptSig shape:
//! `[BIP34 height push][extranonce region push][script-time push][pool tag][user flags]`

use bitcoin::absolute::LockTime;
use bitcoin::consensus;
use bitcoin::hash_types::Txid;
use bitcoin::hashes::Hash;
use bitcoin::script::write_scriptint;
use bitcoin::transaction::{OutPoint, Sequence, Transaction, TxIn, TxOut, Version};
use bitcoin::{Amount, ScriptBuf, Witness};
use thiserror::Error;

use crate::merkle::double_sha256;

/// Bitcoin consensus limit on the coinbase scriptSig.
const MAX_SCRIPT_SIG_LEN: usize = 100;

/// Pool tag limit: printable ASCII, at most this many bytes.
const MAX_TAG_LEN: usize = 40;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum CoinbaseError {
    #[error("coinbase tag exceeds {MAX_TAG_LEN} bytes: {0}")]
    TagTooLong(usize),

    #[error("coinbase tag contains non-printable byte {0:#04x}")]
    TagNotPrintable(u8),

    #[error("coinbase scriptSig would be {0} bytes (limit {MAX_SCRIPT_SIG_LEN})")]
    ScriptSigTooLong(usize),

    #[error("extranonce region of {0} bytes does not fit a direct push")]
    ExtranonceRegionTooLarge(usize),

    #[error("payout percent {0} outside 0..=100")]
    InvalidPercent(f64),

    #[error("empty payout script")]
    EmptyScript,

    #[error("sub-slices claim {sub} sat but parent slice only has {parent} sat")]
    SubSlicesExceedParent { parent: u64, sub: u64 },

    #[error("fee slices claim {fees} sat of {total} sat total")]
    FeesExceedValue { fees: u64, total: u64 },

    #[error("{0} payout outputs exceed the cap of {1}")]
    TooManyOutputs(usize, usize),

    #[error("extranonce length {got} does not match advertised size {want}")]
    BadExtranonceLen { got: usize, want: usize },

    #[error("malformed transaction bytes: {0}")]
    Malformed(String),
}

/// One fee carve-out from the coinbase value.
///
/// Percentages are of the total coinbase value. A parent slice retains
/// its own percentage minus whatever its sub-slices claim.
#[derive(Debug, Clone)]
pub struct FeeSlice {
    pub script: ScriptBuf,
    pub percent: f64,
    pub sub_slices: Vec<FeeSlice>,
}

fn slice_sats(total: u64, percent: f64) -> Result<u64, CoinbaseError> {
    if !(0.0..=100.0).contains(&percent) || !percent.is_finite() {
        return Err(CoinbaseError::InvalidPercent(percent));
    }
    // Hundredth-of-a-percent resolution, floor division.
    let basis_points = (percent * 100.0).round() as u128;
    Ok((total as u128 * basis_points / 10_000) as u64)
}

/// Split the total coinbase value into payout outputs.
///
/// Fee slices come off the top in declaration order; each parent keeps
/// `parent − Σ sub`. Satoshis round down and the remainder goes to
/// `remainder_script` (the winning worker on a solo pool). Zero-valued
/// entries are dropped, so the returned outputs always sum to exactly
/// `total`. Output order is descending by value, stable on ties.
pub fn compute_payouts(
    total: u64,
    slices: &[FeeSlice],
    remainder_script: &ScriptBuf,
    max_outputs: usize,
) -> Result<Vec<TxOut>, CoinbaseError> {
    let mut entries: Vec<(ScriptBuf, u64)> = Vec::new();
    let mut fees_total: u64 = 0;

    for slice in slices {
        if slice.script.is_empty() {
            return Err(CoinbaseError::EmptyScript);
        }
        let parent = slice_sats(total, slice.percent)?;

        let mut sub_total: u64 = 0;
        for sub in &slice.sub_slices {
            if sub.script.is_empty() {
                return Err(CoinbaseError::EmptyScript);
            }
            let sats = slice_sats(total, sub.percent)?;
            sub_total += sats;
            entries.push((sub.script.clone(), sats));
        }

        if sub_total > parent {
            return Err(CoinbaseError::SubSlicesExceedParent {
                parent,
                sub: sub_total,
            });
        }
        entries.push((slice.script.clone(), parent - sub_total));
        fees_total += parent;
    }

    if fees_total > total {
        return Err(CoinbaseError::FeesExceedValue {
            fees: fees_total,
            total,
        });
    }
    if remainder_script.is_empty() {
        return Err(CoinbaseError::EmptyScript);
    }
    entries.push((remainder_script.clone(), total - fees_total));

    entries.retain(|(_, value)| *value > 0);
    entries.sort_by(|a, b| b.1.cmp(&a.1));

    if entries.len() > max_outputs {
        return Err(CoinbaseError::TooManyOutputs(entries.len(), max_outputs));
    }

    Ok(entries
        .into_iter()
        .map(|(script_pubkey, value)| TxOut {
            value: Amount::from_sat(value),
            script_pubkey,
        })
        .collect())
}

/// Minimal scriptint push (BIP34 height, script timestamp).
fn push_scriptint(out: &mut Vec<u8>, n: i64) {
    let mut buf = [0u8; 8];
    let len = write_scriptint(&mut buf, n);
    out.push(len as u8);
    out.extend_from_slice(&buf[..len]);
}

/// The two halves of a serialised coinbase, in both wire forms.
///
/// `coinb1`/`coinb2` split the full serialisation (SegWit framing
/// included when present); the stripped pair splits the txid form. Both
/// splits surround the same `extranonce1 || extranonce2` gap.
#[derive(Debug, Clone)]
pub struct CoinbaseParts {
    pub tx: Transaction,
    pub coinb1: Vec<u8>,
    pub coinb2: Vec<u8>,
    coinb1_stripped: Vec<u8>,
    coinb2_stripped: Vec<u8>,
    extranonce1_len: usize,
    pub extranonce2_size: usize,
}

impl CoinbaseParts {
    /// Reassemble the full serialisation for a concrete extranonce pair.
    pub fn assemble(&self, ex1: &[u8], ex2: &[u8]) -> Result<Vec<u8>, CoinbaseError> {
        self.check_extranonces(ex1, ex2)?;
        let mut out =
            Vec::with_capacity(self.coinb1.len() + ex1.len() + ex2.len() + self.coinb2.len());
        out.extend_from_slice(&self.coinb1);
        out.extend_from_slice(ex1);
        out.extend_from_slice(ex2);
        out.extend_from_slice(&self.coinb2);
        Ok(out)
    }

    /// Txid of the coinbase for a concrete extranonce pair.
    ///
    /// Hashes the witness-stripped serialisation, which for legacy
    /// templates is identical to the full one.
    pub fn txid(&self, ex1: &[u8], ex2: &[u8]) -> Result<Txid, CoinbaseError> {
        self.check_extranonces(ex1, ex2)?;
        let mut bytes = Vec::with_capacity(
            self.coinb1_stripped.len() + ex1.len() + ex2.len() + self.coinb2_stripped.len(),
        );
        bytes.extend_from_slice(&self.coinb1_stripped);
        bytes.extend_from_slice(ex1);
        bytes.extend_from_slice(ex2);
        bytes.extend_from_slice(&self.coinb2_stripped);
        Ok(Txid::from_byte_array(double_sha256(&bytes)))
    }

    fn check_extranonces(&self, ex1: &[u8], ex2: &[u8]) -> Result<(), CoinbaseError> {
        if ex1.len() != self.extranonce1_len {
            return Err(CoinbaseError::BadExtranonceLen {
                got: ex1.len(),
                want: self.extranonce1_len,
            });
        }
        if ex2.len() != self.extranonce2_size {
            return Err(CoinbaseError::BadExtranonceLen {
                got: ex2.len(),
                want: self.extranonce2_size,
            });
        }
        Ok(())
    }
}

/// Builds a job's coinbase transaction and its extranonce split.
#[derive(Debug, Clone)]
pub struct CoinbaseBuilder {
    height: u64,
    value: u64,
    extranonce1_len: usize,
    extranonce2_size: usize,
    required_extranonce2_size: Option<usize>,
    script_time: Option<u64>,
    tag: String,
    user_flags: Vec<u8>,
    outputs: Vec<TxOut>,
    witness_commitment: Option<ScriptBuf>,
}

impl CoinbaseBuilder {
    pub fn new(
        height: u64,
        value: u64,
        extranonce1_len: usize,
        extranonce2_size: usize,
        outputs: Vec<TxOut>,
    ) -> Self {
        Self {
            height,
            value,
            extranonce1_len,
            extranonce2_size,
            required_extranonce2_size: None,
            script_time: None,
            tag: String::new(),
            user_flags: Vec::new(),
            outputs,
            witness_commitment: None,
        }
    }

    /// Pad the extranonce region up to a template-required size so the
    /// on-wire coinbase length is stable regardless of the miner's
    /// extranonce2.
    pub fn with_required_extranonce2_size(mut self, size: usize) -> Self {
        self.required_extranonce2_size = Some(size);
        self
    }

    pub fn with_script_time(mut self, timestamp: u64) -> Self {
        self.script_time = Some(timestamp);
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = tag.into();
        self
    }

    pub fn with_user_flags(mut self, flags: Vec<u8>) -> Self {
        self.user_flags = flags;
        self
    }

    /// Full scriptPubKey bytes of the witness commitment output
    /// (`OP_RETURN 0x24 aa21a9ed <witness root hash>`), as advertised by
    /// the template. Presence switches the coinbase to SegWit framing.
    pub fn with_witness_commitment(mut self, script: ScriptBuf) -> Self {
        self.witness_commitment = Some(script);
        self
    }

    fn script_sig(&self) -> Result<(Vec<u8>, usize), CoinbaseError> {
        if self.tag.len() > MAX_TAG_LEN {
            return Err(CoinbaseError::TagTooLong(self.tag.len()));
        }
        if let Some(byte) = self.tag.bytes().find(|b| !(0x20..=0x7e).contains(b)) {
            return Err(CoinbaseError::TagNotPrintable(byte));
        }

        let pad = self
            .required_extranonce2_size
            .map(|required| required.saturating_sub(self.extranonce2_size))
            .unwrap_or(0);
        let region = self.extranonce1_len + self.extranonce2_size + pad;
        if region == 0 || region > 75 {
            return Err(CoinbaseError::ExtranonceRegionTooLarge(region));
        }

        let mut sig = Vec::with_capacity(MAX_SCRIPT_SIG_LEN);
        push_scriptint(&mut sig, self.height as i64);

        // The extranonce gap begins right after this push opcode.
        sig.push(region as u8);
        let gap_offset = sig.len();
        sig.resize(gap_offset + region, 0);

        if let Some(timestamp) = self.script_time {
            push_scriptint(&mut sig, timestamp as i64);
        }
        if !self.tag.is_empty() {
            sig.push(self.tag.len() as u8);
            sig.extend_from_slice(self.tag.as_bytes());
        }
        sig.extend_from_slice(&self.user_flags);

        if sig.len() > MAX_SCRIPT_SIG_LEN {
            return Err(CoinbaseError::ScriptSigTooLong(sig.len()));
        }
        Ok((sig, gap_offset))
    }

    pub fn build(self) -> Result<CoinbaseParts, CoinbaseError> {
        let (script_sig, gap_offset) = self.script_sig()?;
        let segwit = self.witness_commitment.is_some();

        let witness = if segwit {
            Witness::from_slice(&[[0u8; 32]])
        } else {
            Witness::default()
        };

        let mut outputs = Vec::with_capacity(self.outputs.len() + 1);
        if let Some(commitment) = &self.witness_commitment {
            outputs.push(TxOut {
                value: Amount::from_sat(0),
                script_pubkey: commitment.clone(),
            });
        }
        outputs.extend(self.outputs.iter().cloned());

        let tx = Transaction {
            version: Version::ONE,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::null(),
                script_sig: ScriptBuf::from(script_sig),
                sequence: Sequence::MAX,
                witness,
            }],
            output: outputs,
        };

        // Offset of the extranonce gap inside each serialisation:
        // version, optional marker/flag, input count, prevout, one-byte
        // scriptSig length, then the scriptSig prefix up to the gap.
        let full = consensus::serialize(&tx);
        let full_gap = 4 + if segwit { 2 } else { 0 } + 1 + 36 + 1 + gap_offset;

        let mut stripped_tx = tx.clone();
        stripped_tx.input[0].witness = Witness::default();
        let stripped = consensus::serialize(&stripped_tx);
        let stripped_gap = full_gap - if segwit { 2 } else { 0 };

        let visible = self.extranonce1_len + self.extranonce2_size;
        debug_assert!(
            full[full_gap..full_gap + visible].iter().all(|&b| b == 0),
            "extranonce gap must be zero-filled"
        );

        Ok(CoinbaseParts {
            coinb1: full[..full_gap].to_vec(),
            coinb2: full[full_gap + visible..].to_vec(),
            coinb1_stripped: stripped[..stripped_gap].to_vec(),
            coinb2_stripped: stripped[stripped_gap + visible..].to_vec(),
            tx,
            extranonce1_len: self.extranonce1_len,
            extranonce2_size: self.extranonce2_size,
        })
    }
}

/// Re-serialise a transaction without its witness data.
///
/// `double_sha256` of the result is the txid; of the input, the wtxid.
pub fn strip_witness(raw: &[u8]) -> Result<Vec<u8>, CoinbaseError> {
    let mut tx: Transaction =
        consensus::deserialize(raw).map_err(|e| CoinbaseError::Malformed(e.to_string()))?;
    for input in &mut tx.input {
        input.witness = Witness::default();
    }
    Ok(consensus::serialize(&tx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::Network;
    use bitcoin::address::Address;
    use std::str::FromStr;

    const VALUE: u64 = 625_000_000;

    fn worker_script() -> ScriptBuf {
        Address::from_str("1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa")
            .unwrap()
            .require_network(Network::Bitcoin)
            .unwrap()
            .script_pubkey()
    }

    fn fee_script(byte: u8) -> ScriptBuf {
        ScriptBuf::from(vec![0x76, 0xa9, 0x14, byte, byte, 0x88, 0xac])
    }

    fn commitment_script() -> ScriptBuf {
        let mut bytes = vec![0x6a, 0x24, 0xaa, 0x21, 0xa9, 0xed];
        bytes.extend_from_slice(&[0u8; 32]);
        ScriptBuf::from(bytes)
    }

    fn build_simple() -> CoinbaseParts {
        let outputs =
            compute_payouts(VALUE, &[], &worker_script(), 16).expect("payouts");
        CoinbaseBuilder::new(840_000, VALUE, 4, 8, outputs)
            .with_tag("/tanuki/")
            .with_script_time(1_700_000_000)
            .build()
            .expect("build")
    }

    #[test]
    fn test_split_reassembles_exactly() {
        let parts = build_simple();
        let ex1 = [0xaa, 0xbb, 0xcc, 0xdd];
        let ex2 = [0u8; 8];

        let assembled = parts.assemble(&ex1, &ex2).unwrap();
        let decoded: Transaction = consensus::deserialize(&assembled)
            .expect("assembled coinbase must deserialise");
        assert_eq!(decoded.input.len(), 1);
        assert_eq!(decoded.output.len(), 1);
        assert_eq!(decoded.output[0].value.to_sat(), VALUE);

        // With the builder's zero placeholder, assembly equals the
        // builder's own serialisation.
        let zero_ex1 = [0u8; 4];
        let reassembled = parts.assemble(&zero_ex1, &ex2).unwrap();
        assert_eq!(reassembled, consensus::serialize(&parts.tx));
    }

    #[test]
    fn test_txid_matches_bitcoin_crate() {
        let parts = build_simple();
        let ex1 = [1, 2, 3, 4];
        let ex2 = [5, 6, 7, 8, 9, 10, 11, 12];

        let assembled = parts.assemble(&ex1, &ex2).unwrap();
        let decoded: Transaction = consensus::deserialize(&assembled).unwrap();
        assert_eq!(
            parts.txid(&ex1, &ex2).unwrap(),
            decoded.compute_txid(),
            "split txid must match full decode"
        );
    }

    #[test]
    fn test_segwit_framing_and_txid() {
        let outputs = compute_payouts(VALUE, &[], &worker_script(), 16).unwrap();
        let parts = CoinbaseBuilder::new(840_000, VALUE, 4, 8, outputs)
            .with_tag("/tanuki/")
            .with_witness_commitment(commitment_script())
            .build()
            .unwrap();

        let ex1 = [9, 9, 9, 9];
        let ex2 = [0, 1, 2, 3, 4, 5, 6, 7];
        let assembled = parts.assemble(&ex1, &ex2).unwrap();

        // SegWit marker and flag directly after the version.
        assert_eq!(&assembled[4..6], &[0x00, 0x01]);

        let decoded: Transaction = consensus::deserialize(&assembled).unwrap();
        assert_eq!(decoded.input[0].witness.len(), 1);
        assert_eq!(decoded.input[0].witness[0], [0u8; 32]);
        // Witness commitment output first, zero value.
        assert_eq!(decoded.output[0].value.to_sat(), 0);

        // txid hashes the stripped form.
        assert_eq!(parts.txid(&ex1, &ex2).unwrap(), decoded.compute_txid());
        let stripped = strip_witness(&assembled).unwrap();
        assert_eq!(
            double_sha256(&stripped),
            decoded.compute_txid().to_byte_array()
        );
        assert_eq!(
            double_sha256(&assembled),
            decoded.compute_wtxid().to_byte_array()
        );
    }

    #[test]
    fn test_padding_keeps_length_stable() {
        let outputs = compute_payouts(VALUE, &[], &worker_script(), 16).unwrap();
        let unpadded = CoinbaseBuilder::new(840_000, VALUE, 4, 4, outputs.clone())
            .with_required_extranonce2_size(8)
            .build()
            .unwrap();
        let reference = CoinbaseBuilder::new(840_000, VALUE, 4, 8, outputs)
            .build()
            .unwrap();

        let padded_len = unpadded.assemble(&[0; 4], &[0; 4]).unwrap().len();
        let reference_len = reference.assemble(&[0; 4], &[0; 8]).unwrap().len();
        assert_eq!(
            padded_len, reference_len,
            "padded 4-byte extranonce2 must serialise to the same length as 8"
        );
        // Padding zeros lead coinb2.
        assert!(unpadded.coinb2[..4].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_tag_validation() {
        let outputs = compute_payouts(VALUE, &[], &worker_script(), 16).unwrap();
        let err = CoinbaseBuilder::new(1, VALUE, 4, 8, outputs.clone())
            .with_tag("x".repeat(41))
            .build()
            .unwrap_err();
        assert_eq!(err, CoinbaseError::TagTooLong(41));

        let err = CoinbaseBuilder::new(1, VALUE, 4, 8, outputs)
            .with_tag("bad\ttag")
            .build()
            .unwrap_err();
        assert_eq!(err, CoinbaseError::TagNotPrintable(0x09));
    }

    #[test]
    fn test_scriptsig_length_cap() {
        let outputs = compute_payouts(VALUE, &[], &worker_script(), 16).unwrap();
        let err = CoinbaseBuilder::new(840_000, VALUE, 32, 32, outputs)
            .with_tag("x".repeat(40))
            .build()
            .unwrap_err();
        assert!(matches!(err, CoinbaseError::ScriptSigTooLong(_)));
    }

    #[test]
    fn test_payout_remainder_goes_to_worker() {
        let slices = vec![FeeSlice {
            script: fee_script(1),
            percent: 1.5,
            sub_slices: vec![],
        }];
        let outputs = compute_payouts(VALUE, &slices, &worker_script(), 16).unwrap();

        let total: u64 = outputs.iter().map(|o| o.value.to_sat()).sum();
        assert_eq!(total, VALUE, "outputs must sum to the coinbase value");

        let fee = VALUE * 150 / 10_000;
        assert_eq!(outputs.len(), 2);
        // Descending by value: worker remainder first.
        assert_eq!(outputs[0].value.to_sat(), VALUE - fee);
        assert_eq!(outputs[0].script_pubkey, worker_script());
        assert_eq!(outputs[1].value.to_sat(), fee);
    }

    #[test]
    fn test_payout_sub_slices_carve_from_parent() {
        let slices = vec![FeeSlice {
            script: fee_script(1),
            percent: 2.0,
            sub_slices: vec![FeeSlice {
                script: fee_script(2),
                percent: 0.5,
                sub_slices: vec![],
            }],
        }];
        let outputs = compute_payouts(VALUE, &slices, &worker_script(), 16).unwrap();

        let parent = VALUE * 200 / 10_000;
        let sub = VALUE * 50 / 10_000;
        let values: Vec<u64> = outputs.iter().map(|o| o.value.to_sat()).collect();
        assert!(values.contains(&(parent - sub)), "parent keeps parent - sub");
        assert!(values.contains(&sub));
        assert_eq!(values.iter().sum::<u64>(), VALUE);
    }

    #[test]
    fn test_payout_sub_exceeding_parent_rejected() {
        let slices = vec![FeeSlice {
            script: fee_script(1),
            percent: 1.0,
            sub_slices: vec![FeeSlice {
                script: fee_script(2),
                percent: 2.0,
                sub_slices: vec![],
            }],
        }];
        let err = compute_payouts(VALUE, &slices, &worker_script(), 16).unwrap_err();
        assert!(matches!(err, CoinbaseError::SubSlicesExceedParent { .. }));
    }

    #[test]
    fn test_payout_output_cap() {
        let slices: Vec<FeeSlice> = (1..=5)
            .map(|i| FeeSlice {
                script: fee_script(i),
                percent: 1.0,
                sub_slices: vec![],
            })
            .collect();
        let err = compute_payouts(VALUE, &slices, &worker_script(), 3).unwrap_err();
        assert!(matches!(err, CoinbaseError::TooManyOutputs(6, 3)));
    }

    #[test]
    fn test_payout_zero_fee_dropped() {
        let slices = vec![FeeSlice {
            script: fee_script(1),
            percent: 0.0,
            sub_slices: vec![],
        }];
        let outputs = compute_payouts(VALUE, &slices, &worker_script(), 16).unwrap();
        assert_eq!(outputs.len(), 1, "zero-value slice must not emit an output");
        assert_eq!(outputs[0].value.to_sat(), VALUE);
    }

    #[test]
    fn test_strip_witness_is_identity_for_legacy() {
        let parts = build_simple();
        let assembled = parts.assemble(&[0; 4], &[0; 8]).unwrap();
        assert_eq!(strip_witness(&assembled).unwrap(), assembled);
    }
}
