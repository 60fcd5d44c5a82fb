//! Byte codec for the witness operator stream.
//!
//! The framing follows the cdk-erigon type-2 witness layout: one version
//! header byte, then one opcode byte per operator. Only the four SMT
//! operator shapes exist here; parsing is strict, and an unrecognised
//! opcode fails the whole stream.

use alloy_primitives::{Address, B256};

use crate::smt::{SmtError, SmtResult};
use crate::witness::{Witness, WitnessOperator};

const HEADER: u8 = 0x01;
const OP_BRANCH: u8 = 0x02;
const OP_HASH: u8 = 0x03;
const OP_CODE: u8 = 0x04;
const OP_SMT_LEAF: u8 = 0x07;

impl Witness {
    /// Serializes the operator stream.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![HEADER];
        for operator in &self.operators {
            match operator {
                WitnessOperator::Branch { mask } => {
                    out.push(OP_BRANCH);
                    out.push(*mask as u8);
                }
                WitnessOperator::Hash { hash } => {
                    out.push(OP_HASH);
                    out.extend_from_slice(hash.as_slice());
                }
                WitnessOperator::Code { code } => {
                    out.push(OP_CODE);
                    out.extend_from_slice(&(code.len() as u32).to_be_bytes());
                    out.extend_from_slice(code);
                }
                WitnessOperator::Leaf {
                    node_type,
                    address,
                    storage_key,
                    value,
                } => {
                    out.push(OP_SMT_LEAF);
                    out.push(*node_type);
                    out.extend_from_slice(address.as_slice());
                    out.extend_from_slice(storage_key.as_slice());
                    out.extend_from_slice(&(value.len() as u32).to_be_bytes());
                    out.extend_from_slice(value);
                }
            }
        }
        out
    }

    /// Parses a serialized stream. Fails on a bad header, an unknown
    /// opcode or truncated input; a failed parse yields no operators.
    pub fn parse(bytes: &[u8]) -> SmtResult<Witness> {
        let mut reader = Reader { bytes, pos: 0 };
        if reader.u8()? != HEADER {
            return Err(SmtError::Structural("bad witness header"));
        }
        let mut operators = Vec::new();
        while !reader.done() {
            let operator = match reader.u8()? {
                OP_BRANCH => WitnessOperator::Branch {
                    mask: reader.u8()? as u32,
                },
                OP_HASH => WitnessOperator::Hash {
                    hash: B256::from_slice(reader.take(32)?),
                },
                OP_CODE => {
                    let len = reader.u32()? as usize;
                    WitnessOperator::Code {
                        code: reader.take(len)?.to_vec(),
                    }
                }
                OP_SMT_LEAF => {
                    let node_type = reader.u8()?;
                    let address = Address::from_slice(reader.take(20)?);
                    let storage_key = B256::from_slice(reader.take(32)?);
                    let len = reader.u32()? as usize;
                    WitnessOperator::Leaf {
                        node_type,
                        address,
                        storage_key,
                        value: reader.take(len)?.to_vec(),
                    }
                }
                opcode => return Err(SmtError::UnsupportedOperator(opcode)),
            };
            operators.push(operator);
        }
        Ok(Witness { operators })
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn done(&self) -> bool {
        self.pos == self.bytes.len()
    }

    fn u8(&mut self) -> SmtResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> SmtResult<u32> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn take(&mut self, n: usize) -> SmtResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.bytes.len())
            .ok_or(SmtError::Structural("truncated witness stream"))?;
        let out = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(out)
    }
}
