//! Tensor-parallel collectives.
//!
//! Rank and world size are never ambient: every sharded component receives an
//! `Arc<dyn Communicator>` at construction, so one process can host several
//! independently sharded models. [`SingleRank`] is the identity communicator;
//! [`LocalCommunicator`] connects threads of one process through a ring of
//! `crossbeam` channels.
//!
//! Collectives block until every rank has contributed. A rank that disappears
//! (dropped channel) or contributes a mismatched shape surfaces as
//! [`LayerError::Communication`]; the caller is expected to abort.

use std::fmt;

use candle_core::{DType, Device, Tensor};
use crossbeam::channel::{unbounded, Receiver, Sender};

use crate::{LayerError, LayerResult};

/// Collective operations available to sharded layers.
pub trait Communicator: Send + Sync + fmt::Debug {
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    /// Concatenates every rank's tensor along `dim`, in rank order.
    fn all_gather(&self, tensor: &Tensor, dim: usize) -> LayerResult<Tensor>;

    /// Element-wise sum of every rank's tensor.
    fn all_reduce_sum(&self, tensor: &Tensor) -> LayerResult<Tensor>;

    fn is_parallel(&self) -> bool {
        self.world_size() > 1
    }
}

/// Identity communicator for unsharded execution.
#[derive(Debug, Default, Clone, Copy)]
pub struct SingleRank;

impl Communicator for SingleRank {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn all_gather(&self, tensor: &Tensor, _dim: usize) -> LayerResult<Tensor> {
        Ok(tensor.clone())
    }

    fn all_reduce_sum(&self, tensor: &Tensor) -> LayerResult<Tensor> {
        Ok(tensor.clone())
    }
}

/// One rank's contribution as it travels around the ring.
#[derive(Debug, Clone)]
struct Shard {
    origin: usize,
    dims: Vec<usize>,
    data: Vec<f64>,
}

/// In-process ring member. Build a full group with [`LocalCommunicator::group`].
pub struct LocalCommunicator {
    rank: usize,
    world_size: usize,
    left_rx: Receiver<Shard>,
    right_tx: Sender<Shard>,
}

impl fmt::Debug for LocalCommunicator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalCommunicator")
            .field("rank", &self.rank)
            .field("world_size", &self.world_size)
            .finish()
    }
}

impl LocalCommunicator {
    /// Wires `world_size` ranks into a ring: rank `r` sends to `r + 1` and
    /// receives from `r - 1`. Each communicator is meant to be moved onto its
    /// own thread.
    pub fn group(world_size: usize) -> Vec<LocalCommunicator> {
        let (txs, rxs): (Vec<_>, Vec<_>) = (0..world_size).map(|_| unbounded()).unzip();
        (0..world_size)
            .map(|rank| LocalCommunicator {
                rank,
                world_size,
                left_rx: rxs[(rank + world_size - 1) % world_size].clone(),
                right_tx: txs[rank].clone(),
            })
            .collect()
    }

    /// Ring all-gather of raw shards, returned in rank order.
    fn exchange(&self, tensor: &Tensor) -> LayerResult<Vec<Shard>> {
        let own = Shard {
            origin: self.rank,
            dims: tensor.dims().to_vec(),
            data: tensor.to_dtype(DType::F64)?.flatten_all()?.to_vec1::<f64>()?,
        };
        let mut shards: Vec<Option<Shard>> = vec![None; self.world_size];
        let mut outgoing = own.clone();
        shards[self.rank] = Some(own);

        for _ in 1..self.world_size {
            self.right_tx.send(outgoing).map_err(|_| {
                LayerError::Communication(format!("rank {} lost its right neighbour", self.rank))
            })?;
            let incoming = self.left_rx.recv().map_err(|_| {
                LayerError::Communication(format!("rank {} lost its left neighbour", self.rank))
            })?;
            if incoming.origin >= self.world_size || shards[incoming.origin].is_some() {
                return Err(LayerError::Communication(format!(
                    "rank {} received an unexpected shard from rank {}",
                    self.rank, incoming.origin
                )));
            }
            shards[incoming.origin] = Some(incoming.clone());
            outgoing = incoming;
        }

        shards
            .into_iter()
            .enumerate()
            .map(|(rank, shard)| {
                shard.ok_or_else(|| {
                    LayerError::Communication(format!("no contribution from rank {rank}"))
                })
            })
            .collect()
    }

    fn to_tensor(shard: Shard, dtype: DType, device: &Device) -> LayerResult<Tensor> {
        Ok(Tensor::from_vec(shard.data, shard.dims, device)?.to_dtype(dtype)?)
    }
}

impl Communicator for LocalCommunicator {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn all_gather(&self, tensor: &Tensor, dim: usize) -> LayerResult<Tensor> {
        let dims = tensor.dims().to_vec();
        if dim >= dims.len() {
            return Err(LayerError::shape(format!(
                "all_gather dim {dim} out of range for shape {dims:?}"
            )));
        }
        let shards = self.exchange(tensor)?;
        let mut parts = Vec::with_capacity(shards.len());
        for shard in shards {
            let compatible = shard.dims.len() == dims.len()
                && shard
                    .dims
                    .iter()
                    .zip(&dims)
                    .enumerate()
                    .all(|(axis, (a, b))| axis == dim || a == b);
            if !compatible {
                return Err(LayerError::Communication(format!(
                    "rank {} contributed shape {:?}, incompatible with {:?} along dim {dim}",
                    shard.origin, shard.dims, dims
                )));
            }
            parts.push(Self::to_tensor(shard, tensor.dtype(), tensor.device())?);
        }
        Ok(Tensor::cat(&parts, dim)?)
    }

    fn all_reduce_sum(&self, tensor: &Tensor) -> LayerResult<Tensor> {
        let dims = tensor.dims().to_vec();
        let mut total: Option<Vec<f64>> = None;
        for shard in self.exchange(tensor)? {
            if shard.dims != dims {
                return Err(LayerError::Communication(format!(
                    "rank {} contributed shape {:?}, expected {:?}",
                    shard.origin, shard.dims, dims
                )));
            }
            total = Some(match total {
                None => shard.data,
                Some(mut acc) => {
                    acc.iter_mut().zip(&shard.data).for_each(|(a, b)| *a += b);
                    acc
                }
            });
        }
        let data = total.unwrap_or_default();
        Ok(Tensor::from_vec(data, dims, tensor.device())?.to_dtype(tensor.dtype())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn run_group<F>(world_size: usize, body: F) -> Vec<Tensor>
    where
        F: Fn(LocalCommunicator) -> LayerResult<Tensor> + Send + Sync + Copy + 'static,
    {
        let handles: Vec<_> = LocalCommunicator::group(world_size)
            .into_iter()
            .map(|comm| thread::spawn(move || body(comm)))
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("rank panicked").expect("collective failed"))
            .collect()
    }

    #[test]
    fn ring_all_reduce_sums_every_rank() {
        let results = run_group(4, |comm| {
            let value = (comm.rank() + 1) as f32;
            let tensor = Tensor::full(value, (2, 3), &Device::Cpu)?;
            comm.all_reduce_sum(&tensor)
        });
        for result in results {
            let values = result.flatten_all().unwrap().to_vec1::<f32>().unwrap();
            assert!(values.iter().all(|&v| v == 10.0));
        }
    }

    #[test]
    fn all_gather_concatenates_in_rank_order() {
        let results = run_group(3, |comm| {
            let tensor = Tensor::full(comm.rank() as f32, (2, 1), &Device::Cpu)?;
            comm.all_gather(&tensor, 1)
        });
        for result in results {
            assert_eq!(
                result.to_vec2::<f32>().unwrap(),
                vec![vec![0.0, 1.0, 2.0], vec![0.0, 1.0, 2.0]]
            );
        }
    }

    #[test]
    fn single_rank_is_identity() -> LayerResult<()> {
        let tensor = Tensor::new(&[1f32, 2.0], &Device::Cpu)?;
        let comm = SingleRank;
        assert!(!comm.is_parallel());
        assert_eq!(comm.all_reduce_sum(&tensor)?.to_vec1::<f32>()?, vec![1.0, 2.0]);
        assert_eq!(comm.all_gather(&tensor, 0)?.dims(), &[2]);
        Ok(())
    }

    #[test]
    fn missing_participant_is_reported() {
        let mut group = LocalCommunicator::group(2);
        let lone = group.remove(0);
        drop(group);
        let tensor = Tensor::zeros(2, DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(
            lone.all_reduce_sum(&tensor),
            Err(LayerError::Communication(_))
        ));
    }
}
