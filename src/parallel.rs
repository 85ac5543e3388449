//! Batch varbind encoding for large responses.
//!
//! With the `parallel` cargo feature the batch runs on rayon; without it the
//! same entry points fall back to sequential encoding, so callers never need
//! to care which build they are in.

use crate::pdu::{encode_varbind, ByteOrder};
use crate::value::VarBind;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

#[cfg(feature = "parallel")]
pub fn encode_varbinds_batch(varbinds: &[VarBind], order: ByteOrder) -> Vec<Vec<u8>> {
    varbinds
        .par_iter()
        .map(|vb| {
            let mut buf = Vec::new();
            encode_varbind(&mut buf, vb, order);
            buf
        })
        .collect()
}

#[cfg(not(feature = "parallel"))]
pub fn encode_varbinds_batch(varbinds: &[VarBind], order: ByteOrder) -> Vec<Vec<u8>> {
    varbinds
        .iter()
        .map(|vb| {
            let mut buf = Vec::new();
            encode_varbind(&mut buf, vb, order);
            buf
        })
        .collect()
}

pub fn concat_buffers(buffers: Vec<Vec<u8>>) -> Vec<u8> {
    let total_len: usize = buffers.iter().map(|b| b.len()).sum();
    let mut result = Vec::with_capacity(total_len);
    for buf in buffers {
        result.extend(buf);
    }
    result
}
