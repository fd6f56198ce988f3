use std::ops::Range;

use super::galois;
use crate::config::{EngineConfig, MAX_STRIPE_WIDTH};
use crate::error::{EngineError, Result};

/// Systematic erasure code for one stripe of `k` data and `m` parity chunks.
///
/// Parity row 0 is all ones, so parity chunk 0 is the plain XOR of the data
/// chunks. Rows 1..m come from a Cauchy matrix whose columns were scaled to
/// make row 0 all ones; column scaling keeps every square submatrix
/// non-singular, so any `k` surviving chunks decode.
#[derive(Debug, Clone)]
pub struct CodingEngine {
    data_chunks: usize,
    parity_chunks: usize,
    /// `matrix[p][d]` is the coefficient of data chunk `d` in parity chunk `p`.
    matrix: Vec<Vec<u8>>,
}

impl CodingEngine {
    pub fn new(data_chunks: usize, parity_chunks: usize) -> Result<Self> {
        if data_chunks == 0 || parity_chunks == 0 {
            return Err(EngineError::InvalidConfig(
                "a stripe needs at least one data and one parity chunk".into(),
            ));
        }
        if data_chunks + parity_chunks > MAX_STRIPE_WIDTH {
            return Err(EngineError::InvalidConfig(format!(
                "stripe width {} exceeds {}",
                data_chunks + parity_chunks,
                MAX_STRIPE_WIDTH
            )));
        }

        let cauchy = |p: usize, d: usize| galois::inv((p as u8) ^ ((parity_chunks + d) as u8));
        let matrix = (0..parity_chunks)
            .map(|p| {
                (0..data_chunks)
                    .map(|d| galois::div(cauchy(p, d), cauchy(0, d)))
                    .collect()
            })
            .collect();

        Ok(Self {
            data_chunks,
            parity_chunks,
            matrix,
        })
    }

    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        Self::new(config.data_chunks, config.parity_chunks)
    }

    pub fn data_chunks(&self) -> usize {
        self.data_chunks
    }

    pub fn parity_chunks(&self) -> usize {
        self.parity_chunks
    }

    pub fn stripe_width(&self) -> usize {
        self.data_chunks + self.parity_chunks
    }

    pub fn coefficient(&self, parity_index: usize, data_index: usize) -> u8 {
        self.matrix[parity_index][data_index]
    }

    /// Computes `parity[range]` from the same range of every data chunk.
    ///
    /// `None` inputs count as zero-filled chunks. The output range is
    /// overwritten, the rest of `parity` is left untouched.
    pub fn encode(
        &self,
        data: &[Option<&[u8]>],
        parity: &mut [u8],
        parity_index: usize,
        range: Range<usize>,
    ) -> Result<()> {
        if data.len() != self.data_chunks || parity_index >= self.parity_chunks {
            return Err(EngineError::InvalidConfig(format!(
                "encode expects {} data chunks and parity index < {}",
                self.data_chunks, self.parity_chunks
            )));
        }
        check_range(range.start, range.end, parity.len())?;

        let out = &mut parity[range.clone()];
        out.fill(0);
        for (data_index, chunk) in data.iter().enumerate() {
            let Some(chunk) = chunk else { continue };
            check_range(range.start, range.end, chunk.len())?;
            galois::mul_xor_into(
                self.coefficient(parity_index, data_index),
                out,
                &chunk[range.clone()],
            );
        }
        Ok(())
    }

    /// Folds a data-side byte delta (old XOR new) into a parity chunk.
    pub fn fold(
        &self,
        parity: &mut [u8],
        parity_index: usize,
        data_index: usize,
        offset: usize,
        delta: &[u8],
    ) -> Result<()> {
        if parity_index >= self.parity_chunks || data_index >= self.data_chunks {
            return Err(EngineError::InvalidConfig(format!(
                "no coefficient for parity {} / data {}",
                parity_index, data_index
            )));
        }
        let end = offset + delta.len();
        check_range(offset, end, parity.len())?;
        galois::mul_xor_into(
            self.coefficient(parity_index, data_index),
            &mut parity[offset..end],
            delta,
        );
        Ok(())
    }

    /// Rebuilds every `None` slot of a stripe (`k` data slots followed by `m`
    /// parity slots) from any `k` present slots. Returns the rebuilt indices.
    pub fn decode(&self, chunks: &mut [Option<Vec<u8>>]) -> Result<Vec<usize>> {
        let k = self.data_chunks;
        if chunks.len() != self.stripe_width() {
            return Err(EngineError::InvalidConfig(format!(
                "decode expects {} slots, got {}",
                self.stripe_width(),
                chunks.len()
            )));
        }

        let present: Vec<usize> = (0..chunks.len()).filter(|&i| chunks[i].is_some()).collect();
        let missing: Vec<usize> = (0..chunks.len()).filter(|&i| chunks[i].is_none()).collect();
        if present.len() < k {
            return Err(EngineError::InsufficientChunks {
                available: present.len(),
                required: k,
            });
        }
        if missing.is_empty() {
            return Ok(missing);
        }

        let len = chunks[present[0]].as_ref().map(Vec::len).unwrap_or(0);
        for &i in &present {
            let slot_len = chunks[i].as_ref().map(Vec::len).unwrap_or(0);
            if slot_len != len {
                return Err(EngineError::OutOfRange {
                    offset: 0,
                    end: slot_len,
                    capacity: len,
                });
            }
        }

        // Single loss inside the XOR group: fold the k survivors of data + parity 0.
        if missing.len() == 1 && missing[0] <= k && (0..=k).all(|i| i == missing[0] || chunks[i].is_some())
        {
            let mut rebuilt = vec![0u8; len];
            for chunk in chunks[..=k].iter().flatten() {
                galois::xor_into(&mut rebuilt, chunk);
            }
            chunks[missing[0]] = Some(rebuilt);
            return Ok(missing);
        }

        let chosen: Vec<usize> = present.iter().copied().take(k).collect();
        let rows: Vec<Vec<u8>> = chosen
            .iter()
            .map(|&slot| {
                if slot < k {
                    (0..k).map(|d| u8::from(d == slot)).collect()
                } else {
                    self.matrix[slot - k].clone()
                }
            })
            .collect();
        let inverse = galois::invert(&rows).ok_or(EngineError::InsufficientChunks {
            available: present.len(),
            required: k,
        })?;

        let mut rebuilt_data = Vec::new();
        for &data_index in missing.iter().filter(|&&i| i < k) {
            let mut out = vec![0u8; len];
            for (row, &slot) in chosen.iter().enumerate() {
                if let Some(source) = chunks[slot].as_ref() {
                    galois::mul_xor_into(inverse[data_index][row], &mut out, source);
                }
            }
            rebuilt_data.push((data_index, out));
        }
        for (data_index, out) in rebuilt_data {
            chunks[data_index] = Some(out);
        }

        let mut rebuilt_parity = Vec::new();
        for &slot in missing.iter().filter(|&&i| i >= k) {
            let mut out = vec![0u8; len];
            let data: Vec<Option<&[u8]>> = chunks[..k].iter().map(|c| c.as_deref()).collect();
            self.encode(&data, &mut out, slot - k, 0..len)?;
            rebuilt_parity.push((slot, out));
        }
        for (slot, out) in rebuilt_parity {
            chunks[slot] = Some(out);
        }

        Ok(missing)
    }
}

fn check_range(offset: usize, end: usize, capacity: usize) -> Result<()> {
    if offset > end || end > capacity {
        return Err(EngineError::OutOfRange {
            offset,
            end,
            capacity,
        });
    }
    Ok(())
}
