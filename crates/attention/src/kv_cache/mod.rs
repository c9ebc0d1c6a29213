//! Caller-owned key/value cache for incremental decoding.
//!
//! The cache holds projected keys and values shaped
//! `[batch, kv_heads, cached_len, head_dim]`. It is passed to attention by
//! `&mut` and grows along the time axis; a sliding window drops the oldest
//! positions first. The cache is `Send` but not `Sync`: one decoding stream
//! owns it at a time.

use std::cell::Cell;
use std::marker::PhantomData;

use candle_core::Tensor;

use crate::core::{AttentionError, AttentionResult};

/// Counters describing how a cache has been used.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Positions written through `replace` or `append`.
    pub appended: usize,
    /// Positions dropped by window eviction.
    pub evicted: usize,
    /// Times previously filled content was discarded.
    pub resets: usize,
}

#[derive(Debug, Clone, Default)]
pub struct KvCache {
    keys: Option<Tensor>,
    values: Option<Tensor>,
    start: usize,
    stats: CacheStats,
    _not_sync: PhantomData<Cell<()>>,
}

fn check_pair(keys: &Tensor, values: &Tensor) -> AttentionResult<()> {
    if keys.rank() != 4 || keys.dims() != values.dims() {
        return Err(AttentionError::shape(format!(
            "cache entries must be matching [batch, kv_heads, time, head_dim] tensors, got keys {:?} values {:?}",
            keys.dims(),
            values.dims()
        )));
    }
    Ok(())
}

impl KvCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of cached positions.
    pub fn len(&self) -> usize {
        self.keys.as_ref().map(|k| k.dims()[2]).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Absolute position of the oldest cached key.
    pub fn start(&self) -> usize {
        self.start
    }

    pub fn keys(&self) -> Option<&Tensor> {
        self.keys.as_ref()
    }

    pub fn values(&self) -> Option<&Tensor> {
        self.values.as_ref()
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    pub fn clear(&mut self) {
        if !self.is_empty() {
            self.stats.resets += 1;
        }
        self.keys = None;
        self.values = None;
        self.start = 0;
    }

    /// Discards the current content and stores `keys`/`values` from position 0.
    pub fn replace(&mut self, keys: Tensor, values: Tensor) -> AttentionResult<()> {
        check_pair(&keys, &values)?;
        self.clear();
        self.stats.appended += keys.dims()[2];
        self.keys = Some(keys);
        self.values = Some(values);
        Ok(())
    }

    /// Appends along the time axis and returns the full cached keys and values.
    pub fn append(&mut self, keys: &Tensor, values: &Tensor) -> AttentionResult<(Tensor, Tensor)> {
        check_pair(keys, values)?;
        let (merged_keys, merged_values) = match (&self.keys, &self.values) {
            (Some(cached_keys), Some(cached_values)) => {
                let (cb, ch, _, cd) = cached_keys.dims4()?;
                let (b, h, _, d) = keys.dims4()?;
                if (cb, ch, cd) != (b, h, d) {
                    return Err(AttentionError::shape(format!(
                        "cannot append [{b}, {h}, _, {d}] to a cache of [{cb}, {ch}, _, {cd}]"
                    )));
                }
                (
                    Tensor::cat(&[cached_keys, keys], 2)?,
                    Tensor::cat(&[cached_values, values], 2)?,
                )
            }
            _ => (keys.clone(), values.clone()),
        };
        self.stats.appended += keys.dims()[2];
        self.keys = Some(merged_keys.clone());
        self.values = Some(merged_values.clone());
        Ok((merged_keys, merged_values))
    }

    /// Keeps only the most recent `window` positions. Returns how many were dropped.
    pub fn evict_to_window(&mut self, window: usize) -> AttentionResult<usize> {
        let len = self.len();
        if len <= window {
            return Ok(0);
        }
        let dropped = len - window;
        if let (Some(keys), Some(values)) = (&self.keys, &self.values) {
            let keys = keys.narrow(2, dropped, window)?.contiguous()?;
            let values = values.narrow(2, dropped, window)?.contiguous()?;
            self.keys = Some(keys);
            self.values = Some(values);
        }
        self.start += dropped;
        self.stats.evicted += dropped;
        log::debug!(
            "kv-cache evicted {dropped} positions, window={window} start={}",
            self.start
        );
        Ok(dropped)
    }

    /// Reads `len` positions starting at absolute position `from`.
    pub fn read(&self, from: usize, len: usize) -> AttentionResult<(Tensor, Tensor)> {
        let end = self.start + self.len();
        if from < self.start || from + len > end {
            return Err(AttentionError::shape(format!(
                "cache read [{from}, {}) outside cached positions [{}, {end})",
                from + len,
                self.start
            )));
        }
        match (&self.keys, &self.values) {
            (Some(keys), Some(values)) => {
                let offset = from - self.start;
                Ok((keys.narrow(2, offset, len)?, values.narrow(2, offset, len)?))
            }
            _ => Err(AttentionError::shape("cache is empty")),
        }
    }
}
