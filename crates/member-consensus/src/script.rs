//! Consensus script interpreter.
//!
//! Implements the opcode subset the kernel's validation rules reference:
//! data pushes, stack and equality ops, the hash opcodes, and ECDSA
//! signature checks against the spent output's scriptPubKey. Signature
//! verification consults the bounded signature cache and polls the worker's
//! cancellation token, which is the innermost cancellation point of block
//! validation.

use crate::cancel::CancelToken;
use crate::hash::{hash160, sha256, sha256d, Hash256};
use crate::serialize::{write_compact_size, write_i32, write_u32};
use crate::sigcache::SigCache;
use crate::tx::Transaction;
use crate::{ConsensusError, ConsensusResult};
use once_cell::sync::Lazy;
use secp256k1::{ecdsa::Signature, Message, PublicKey, Secp256k1, VerifyOnly};
use thiserror::Error;

/// Maximum size of a pushed stack element.
pub const MAX_SCRIPT_ELEMENT_SIZE: usize = 520;
/// Maximum non-push operations per script.
pub const MAX_OPS_PER_SCRIPT: usize = 201;
/// Maximum combined stack depth.
pub const MAX_STACK_SIZE: usize = 1000;
/// Maximum script length in bytes.
pub const MAX_SCRIPT_SIZE: usize = 10_000;

/// The only hash type the kernel signs and verifies.
pub const SIGHASH_ALL: u8 = 0x01;

// Opcodes.
pub const OP_0: u8 = 0x00;
pub const OP_PUSHDATA1: u8 = 0x4c;
pub const OP_PUSHDATA2: u8 = 0x4d;
pub const OP_PUSHDATA4: u8 = 0x4e;
pub const OP_1NEGATE: u8 = 0x4f;
pub const OP_1: u8 = 0x51;
pub const OP_16: u8 = 0x60;
pub const OP_NOP: u8 = 0x61;
pub const OP_VERIFY: u8 = 0x69;
pub const OP_RETURN: u8 = 0x6a;
pub const OP_DROP: u8 = 0x75;
pub const OP_DUP: u8 = 0x76;
pub const OP_EQUAL: u8 = 0x87;
pub const OP_EQUALVERIFY: u8 = 0x88;
pub const OP_SHA256: u8 = 0xa8;
pub const OP_HASH160: u8 = 0xa9;
pub const OP_HASH256: u8 = 0xaa;
pub const OP_CHECKSIG: u8 = 0xac;
pub const OP_CHECKSIGVERIFY: u8 = 0xad;
pub const OP_CHECKMULTISIG: u8 = 0xae;
pub const OP_CHECKMULTISIGVERIFY: u8 = 0xaf;

static SECP: Lazy<Secp256k1<VerifyOnly>> = Lazy::new(Secp256k1::verification_only);

/// Script execution failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScriptError {
    #[error("script too large")]
    ScriptSize,
    #[error("push exceeds element size limit")]
    PushSize,
    #[error("operation limit exceeded")]
    OpCount,
    #[error("stack size limit exceeded")]
    StackSize,
    #[error("unbalanced or empty stack")]
    InvalidStackOperation,
    #[error("OP_RETURN encountered")]
    OpReturn,
    #[error("disabled or unknown opcode {0:#04x}")]
    BadOpcode(u8),
    #[error("OP_VERIFY failed")]
    Verify,
    #[error("OP_EQUALVERIFY failed")]
    EqualVerify,
    #[error("signature check failed")]
    CheckSigVerify,
    #[error("scriptSig is not push-only")]
    SigPushOnly,
    #[error("script evaluated to false")]
    EvalFalse,
    #[error("truncated push")]
    BadPush,
    #[error("validation canceled")]
    Canceled,
}

/// Script verification flags, chosen per block from the chain's activation
/// state.
#[derive(Debug, Clone, Copy)]
pub struct ScriptFlags {
    /// Require scriptSigs to contain only data pushes.
    pub sig_push_only: bool,
}

impl Default for ScriptFlags {
    fn default() -> Self {
        Self {
            sig_push_only: true,
        }
    }
}

/// Signature checking behavior, abstracted so tests can run scripts without
/// real keys.
pub trait SignatureChecker {
    /// Verify `sig` (DER plus trailing hash-type byte) by `pubkey` over the
    /// script being executed. Returns `Ok(false)` for a well-formed but
    /// wrong signature; errors abort the script.
    fn check_sig(
        &self,
        sig: &[u8],
        pubkey: &[u8],
        script_code: &[u8],
    ) -> Result<bool, ScriptError>;
}

/// A checker that fails every signature. Used where scripts must not reach
/// a CHECKSIG (coinbase inputs) and in structural tests.
pub struct NoSignatureCheck;

impl SignatureChecker for NoSignatureCheck {
    fn check_sig(&self, _: &[u8], _: &[u8], _: &[u8]) -> Result<bool, ScriptError> {
        Ok(false)
    }
}

/// Checks signatures against a transaction input, consulting the signature
/// cache and polling the cancellation token before any ECDSA work.
pub struct TransactionSignatureChecker<'a> {
    tx: &'a Transaction,
    input_index: usize,
    sig_cache: Option<&'a SigCache>,
    cancel: Option<&'a CancelToken>,
}

impl<'a> TransactionSignatureChecker<'a> {
    /// Create a checker for one input of `tx`.
    pub fn new(
        tx: &'a Transaction,
        input_index: usize,
        sig_cache: Option<&'a SigCache>,
        cancel: Option<&'a CancelToken>,
    ) -> Self {
        Self {
            tx,
            input_index,
            sig_cache,
            cancel,
        }
    }
}

impl SignatureChecker for TransactionSignatureChecker<'_> {
    fn check_sig(
        &self,
        sig: &[u8],
        pubkey: &[u8],
        script_code: &[u8],
    ) -> Result<bool, ScriptError> {
        if let Some(cancel) = self.cancel {
            if cancel.is_canceled() {
                return Err(ScriptError::Canceled);
            }
        }
        if sig.is_empty() {
            return Ok(false);
        }

        let hash_type = sig[sig.len() - 1];
        if hash_type != SIGHASH_ALL {
            return Ok(false);
        }
        let der = &sig[..sig.len() - 1];

        let sighash = signature_hash(self.tx, self.input_index, script_code, hash_type);

        if let Some(cache) = self.sig_cache {
            if cache.contains(&sighash, pubkey, sig) {
                return Ok(true);
            }
        }

        let Ok(pk) = PublicKey::from_slice(pubkey) else {
            return Ok(false);
        };
        let Ok(mut signature) = Signature::from_der(der) else {
            return Ok(false);
        };
        signature.normalize_s();
        let message = Message::from_digest(*sighash.as_bytes());

        let valid = SECP.verify_ecdsa(&message, &signature, &pk).is_ok();
        if valid {
            if let Some(cache) = self.sig_cache {
                cache.insert(&sighash, pubkey, sig);
            }
        }
        Ok(valid)
    }
}

/// The digest signatures commit to: the transaction serialized with the
/// spent output's script substituted into the signed input, empty scriptSigs
/// elsewhere, and the hash type appended.
pub fn signature_hash(
    tx: &Transaction,
    input_index: usize,
    script_code: &[u8],
    hash_type: u8,
) -> Hash256 {
    let mut out = Vec::with_capacity(tx.serialized_size() + script_code.len() + 8);
    write_i32(&mut out, tx.version);
    write_compact_size(&mut out, tx.inputs.len() as u64);
    for (i, input) in tx.inputs.iter().enumerate() {
        input.prevout.encode_to(&mut out);
        if i == input_index {
            write_compact_size(&mut out, script_code.len() as u64);
            out.extend_from_slice(script_code);
        } else {
            write_compact_size(&mut out, 0);
        }
        write_u32(&mut out, input.sequence);
    }
    write_compact_size(&mut out, tx.outputs.len() as u64);
    for output in &tx.outputs {
        crate::serialize::write_i64(&mut out, output.value);
        write_compact_size(&mut out, output.script_pubkey.len() as u64);
        out.extend_from_slice(&output.script_pubkey);
    }
    write_u32(&mut out, tx.lock_time);
    write_u32(&mut out, hash_type as u32);
    sha256d(&out)
}

fn cast_to_bool(element: &[u8]) -> bool {
    for (i, &b) in element.iter().enumerate() {
        if b != 0 {
            // Negative zero is false.
            return !(i == element.len() - 1 && b == 0x80);
        }
    }
    false
}

fn read_push<'a>(script: &'a [u8], pc: &mut usize, opcode: u8) -> Result<&'a [u8], ScriptError> {
    let len = match opcode {
        n @ 0x01..=0x4b => n as usize,
        OP_PUSHDATA1 => {
            let n = *script.get(*pc).ok_or(ScriptError::BadPush)? as usize;
            *pc += 1;
            n
        }
        OP_PUSHDATA2 => {
            let bytes = script.get(*pc..*pc + 2).ok_or(ScriptError::BadPush)?;
            *pc += 2;
            u16::from_le_bytes([bytes[0], bytes[1]]) as usize
        }
        OP_PUSHDATA4 => {
            let bytes = script.get(*pc..*pc + 4).ok_or(ScriptError::BadPush)?;
            *pc += 4;
            u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize
        }
        _ => 0,
    };
    if len > MAX_SCRIPT_ELEMENT_SIZE {
        return Err(ScriptError::PushSize);
    }
    let data = script.get(*pc..*pc + len).ok_or(ScriptError::BadPush)?;
    *pc += len;
    Ok(data)
}

/// Execute one script over the given stack.
pub fn eval_script(
    script: &[u8],
    stack: &mut Vec<Vec<u8>>,
    checker: &dyn SignatureChecker,
) -> Result<(), ScriptError> {
    if script.len() > MAX_SCRIPT_SIZE {
        return Err(ScriptError::ScriptSize);
    }

    let mut pc = 0usize;
    let mut op_count = 0usize;

    while pc < script.len() {
        let opcode = script[pc];
        pc += 1;

        if opcode <= OP_PUSHDATA4 {
            let data = if opcode == OP_0 {
                &[][..]
            } else {
                read_push(script, &mut pc, opcode)?
            };
            stack.push(data.to_vec());
        } else {
            op_count += 1;
            if op_count > MAX_OPS_PER_SCRIPT {
                return Err(ScriptError::OpCount);
            }

            match opcode {
                OP_1NEGATE => stack.push(vec![0x81]),
                n @ OP_1..=OP_16 => stack.push(vec![n - OP_1 + 1]),
                OP_NOP => {}
                OP_RETURN => return Err(ScriptError::OpReturn),
                OP_DUP => {
                    let top = stack.last().ok_or(ScriptError::InvalidStackOperation)?;
                    stack.push(top.clone());
                }
                OP_DROP => {
                    stack.pop().ok_or(ScriptError::InvalidStackOperation)?;
                }
                OP_VERIFY => {
                    let top = stack.pop().ok_or(ScriptError::InvalidStackOperation)?;
                    if !cast_to_bool(&top) {
                        return Err(ScriptError::Verify);
                    }
                }
                OP_EQUAL | OP_EQUALVERIFY => {
                    let b = stack.pop().ok_or(ScriptError::InvalidStackOperation)?;
                    let a = stack.pop().ok_or(ScriptError::InvalidStackOperation)?;
                    let equal = a == b;
                    if opcode == OP_EQUALVERIFY {
                        if !equal {
                            return Err(ScriptError::EqualVerify);
                        }
                    } else {
                        stack.push(if equal { vec![1] } else { vec![] });
                    }
                }
                OP_SHA256 => {
                    let top = stack.pop().ok_or(ScriptError::InvalidStackOperation)?;
                    stack.push(sha256(&top).to_vec());
                }
                OP_HASH160 => {
                    let top = stack.pop().ok_or(ScriptError::InvalidStackOperation)?;
                    stack.push(hash160(&top).to_vec());
                }
                OP_HASH256 => {
                    let top = stack.pop().ok_or(ScriptError::InvalidStackOperation)?;
                    stack.push(sha256d(&top).as_bytes().to_vec());
                }
                OP_CHECKSIG | OP_CHECKSIGVERIFY => {
                    let pubkey = stack.pop().ok_or(ScriptError::InvalidStackOperation)?;
                    let sig = stack.pop().ok_or(ScriptError::InvalidStackOperation)?;
                    let valid = checker.check_sig(&sig, &pubkey, script)?;
                    if opcode == OP_CHECKSIGVERIFY {
                        if !valid {
                            return Err(ScriptError::CheckSigVerify);
                        }
                    } else {
                        stack.push(if valid { vec![1] } else { vec![] });
                    }
                }
                other => return Err(ScriptError::BadOpcode(other)),
            }
        }

        if stack.len() > MAX_STACK_SIZE {
            return Err(ScriptError::StackSize);
        }
    }

    Ok(())
}

/// Verify an input: run the scriptSig, then the scriptPubKey over the
/// resulting stack, and require a truthy top element.
pub fn verify_script(
    script_sig: &[u8],
    script_pubkey: &[u8],
    flags: ScriptFlags,
    checker: &dyn SignatureChecker,
) -> Result<(), ScriptError> {
    if flags.sig_push_only && !is_push_only(script_sig) {
        return Err(ScriptError::SigPushOnly);
    }

    let mut stack: Vec<Vec<u8>> = Vec::new();
    eval_script(script_sig, &mut stack, checker)?;
    eval_script(script_pubkey, &mut stack, checker)?;

    match stack.last() {
        Some(top) if cast_to_bool(top) => Ok(()),
        _ => Err(ScriptError::EvalFalse),
    }
}

/// Whether a script consists solely of data pushes.
pub fn is_push_only(script: &[u8]) -> bool {
    let mut pc = 0usize;
    while pc < script.len() {
        let opcode = script[pc];
        pc += 1;
        if opcode > OP_16 {
            return false;
        }
        if opcode != OP_0 && opcode <= OP_PUSHDATA4 && opcode < OP_1NEGATE {
            if read_push(script, &mut pc, opcode).is_err() {
                return false;
            }
        }
    }
    true
}

/// Legacy signature-operation count: CHECKSIG ops count one, multisig ops
/// count the worst-case twenty.
pub fn count_sigops(script: &[u8]) -> u64 {
    let mut count = 0u64;
    let mut pc = 0usize;
    while pc < script.len() {
        let opcode = script[pc];
        pc += 1;
        if opcode != OP_0 && opcode <= OP_PUSHDATA4 {
            if read_push(script, &mut pc, opcode).is_err() {
                break;
            }
            continue;
        }
        match opcode {
            OP_CHECKSIG | OP_CHECKSIGVERIFY => count += 1,
            OP_CHECKMULTISIG | OP_CHECKMULTISIGVERIFY => count += 20,
            _ => {}
        }
    }
    count
}

/// A standard pay-to-pubkey-hash locking script.
pub fn p2pkh_script(pubkey_hash: &[u8; 20]) -> Vec<u8> {
    let mut script = Vec::with_capacity(25);
    script.push(OP_DUP);
    script.push(OP_HASH160);
    script.push(20);
    script.extend_from_slice(pubkey_hash);
    script.push(OP_EQUALVERIFY);
    script.push(OP_CHECKSIG);
    script
}

/// A pay-to-pubkey locking script.
pub fn p2pk_script(pubkey: &[u8]) -> Vec<u8> {
    let mut script = Vec::with_capacity(pubkey.len() + 2);
    script.push(pubkey.len() as u8);
    script.extend_from_slice(pubkey);
    script.push(OP_CHECKSIG);
    script
}

/// Minimal script-number encoding (little-endian, sign in the top bit).
pub fn encode_scriptnum(value: i64) -> Vec<u8> {
    if value == 0 {
        return Vec::new();
    }
    let negative = value < 0;
    let mut abs = value.unsigned_abs();
    let mut out = Vec::new();
    while abs > 0 {
        out.push((abs & 0xff) as u8);
        abs >>= 8;
    }
    let last = *out.last().unwrap();
    if last & 0x80 != 0 {
        out.push(if negative { 0x80 } else { 0x00 });
    } else if negative {
        *out.last_mut().unwrap() = last | 0x80;
    }
    out
}

/// Decode a script number of at most `max_len` bytes.
pub fn decode_scriptnum(bytes: &[u8], max_len: usize) -> ConsensusResult<i64> {
    if bytes.len() > max_len {
        return Err(ConsensusError::Script("script number overflow".into()));
    }
    if bytes.is_empty() {
        return Ok(0);
    }
    let mut value: i64 = 0;
    for (i, &b) in bytes.iter().enumerate() {
        if i == bytes.len() - 1 {
            value |= ((b & 0x7f) as i64) << (8 * i);
            if b & 0x80 != 0 {
                value = -value;
            }
        } else {
            value |= (b as i64) << (8 * i);
        }
    }
    Ok(value)
}

/// Coinbase scriptSig carrying the block height as a minimal script number,
/// padded with a NOP so the script meets the minimum coinbase length.
pub fn coinbase_height_script(height: u32) -> Vec<u8> {
    let num = encode_scriptnum(height as i64);
    let mut script = Vec::with_capacity(num.len() + 2);
    if num.is_empty() {
        script.push(OP_0);
    } else if num.len() == 1 && (1..=16).contains(&num[0]) {
        script.push(OP_1 + num[0] - 1);
    } else {
        script.push(num.len() as u8);
        script.extend_from_slice(&num);
    }
    script.push(OP_NOP);
    script
}

/// Parse the height from a coinbase scriptSig.
pub fn parse_coinbase_height(sig: &[u8]) -> ConsensusResult<u32> {
    let first = *sig
        .first()
        .ok_or_else(|| ConsensusError::Script("empty coinbase scriptSig".into()))?;
    if first == OP_0 {
        return Ok(0);
    }
    if (OP_1..=OP_16).contains(&first) {
        return Ok((first - OP_1 + 1) as u32);
    }
    let len = first as usize;
    if len > 0x4b || sig.len() < 1 + len {
        return Err(ConsensusError::Script("malformed coinbase height".into()));
    }
    let height = decode_scriptnum(&sig[1..1 + len], len)?;
    u32::try_from(height).map_err(|_| ConsensusError::Script("negative coinbase height".into()))
}
