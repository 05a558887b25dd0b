// Copyright 2022 The mt-dnn-rs Authors
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//     http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! # Data-parallel synchronization
//! Collective operations used to average gradients and training statistics across the ranks of a
//! data-parallel run. `SingleProcess` is the no-op group of non distributed training, `ThreadGroup`
//! connects ranks running as threads of the same process.

use crate::common::error::MtDnnError;
use std::sync::{Arc, Barrier, Mutex};
use tch::{no_grad, Device, Kind, Tensor};

/// # Collective communication between data-parallel ranks
pub trait ProcessGroup: Send + Sync {
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    /// Replaces `values` by their element-wise sum over all ranks. Every rank must call this with a
    /// buffer of the same length.
    fn all_reduce_sum(&self, values: &mut [f32]) -> Result<(), MtDnnError>;
}

/// # Group of a single, non distributed process
#[derive(Debug, Default, Clone, Copy)]
pub struct SingleProcess;

impl ProcessGroup for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn all_reduce_sum(&self, _values: &mut [f32]) -> Result<(), MtDnnError> {
        Ok(())
    }
}

struct SharedBuffer {
    barrier: Barrier,
    buffer: Mutex<Vec<f32>>,
}

/// # Ranks running as threads of one process
pub struct ThreadGroup {
    rank: usize,
    world_size: usize,
    shared: Arc<SharedBuffer>,
}

impl ThreadGroup {
    /// Creates the handles of a group of `world_size` ranks, one per thread.
    pub fn new_group(world_size: usize) -> Vec<ThreadGroup> {
        let shared = Arc::new(SharedBuffer {
            barrier: Barrier::new(world_size),
            buffer: Mutex::new(Vec::new()),
        });
        (0..world_size)
            .map(|rank| ThreadGroup {
                rank,
                world_size,
                shared: shared.clone(),
            })
            .collect()
    }

    fn lock_buffer(&self) -> Result<std::sync::MutexGuard<'_, Vec<f32>>, MtDnnError> {
        self.shared
            .buffer
            .lock()
            .map_err(|_| MtDnnError::ValueError("all-reduce buffer poisoned".to_string()))
    }
}

impl ProcessGroup for ThreadGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn all_reduce_sum(&self, values: &mut [f32]) -> Result<(), MtDnnError> {
        // every rank has read the previous result once all ranks reach this point
        if self.shared.barrier.wait().is_leader() {
            let mut buffer = self.lock_buffer()?;
            buffer.clear();
            buffer.resize(values.len(), 0.0);
        }
        self.shared.barrier.wait();
        let length_matches = {
            let mut buffer = self.lock_buffer()?;
            let length_matches = buffer.len() == values.len();
            if length_matches {
                for (accumulator, value) in buffer.iter_mut().zip(values.iter()) {
                    *accumulator += *value;
                }
            }
            length_matches
        };
        self.shared.barrier.wait();
        if !length_matches {
            return Err(MtDnnError::ValueError(format!(
                "rank {} all-reduce buffer length {} does not match the group",
                self.rank,
                values.len()
            )));
        }
        values.copy_from_slice(&self.lock_buffer()?);
        Ok(())
    }
}

/// Averages the statistics of a training step over all ranks with a single collective call.
///
/// `shared` is produced by every rank. `partial` may be missing on some ranks: it is averaged over
/// the ranks that produced it and is `None` when no rank did. Every rank issues the same call
/// whether or not it holds `partial`.
pub fn all_reduce_statistics<const N: usize>(
    group: &dyn ProcessGroup,
    shared: f64,
    partial: Option<[f64; N]>,
) -> Result<(f64, Option<[f64; N]>), MtDnnError> {
    let mut buffer = vec![0f32; N + 2];
    buffer[0] = shared as f32;
    if let Some(partial) = partial {
        buffer[1] = 1.0;
        for (slot, value) in buffer[2..].iter_mut().zip(partial.iter()) {
            *slot = *value as f32;
        }
    }
    group.all_reduce_sum(&mut buffer)?;

    let shared = buffer[0] as f64 / group.world_size() as f64;
    let contributors = buffer[1];
    if contributors < 0.5 {
        return Ok((shared, None));
    }
    let mut averaged = [0f64; N];
    for (slot, value) in averaged.iter_mut().zip(buffer[2..].iter()) {
        *slot = (*value / contributors) as f64;
    }
    Ok((shared, Some(averaged)))
}

/// Replaces the gradient of every parameter by its average over all ranks. Parameters without a
/// gradient on this rank contribute zeros, and receive the average when another rank produced one.
pub fn all_reduce_gradients<'a, I>(
    group: &dyn ProcessGroup,
    parameters: I,
) -> Result<(), MtDnnError>
where
    I: IntoIterator<Item = &'a Tensor>,
{
    if group.world_size() == 1 {
        return Ok(());
    }
    let parameters = parameters.into_iter().collect::<Vec<&Tensor>>();
    let mut flat = Vec::new();
    for param in parameters.iter() {
        let grad = param.grad();
        if grad.defined() {
            let values = Vec::<f32>::try_from(
                grad.to_kind(Kind::Float)
                    .to_device(Device::Cpu)
                    .flatten(0, -1),
            )?;
            flat.extend(values);
        } else {
            flat.extend(std::iter::repeat(0f32).take(param.numel()));
        }
    }
    group.all_reduce_sum(&mut flat)?;
    let world_size = group.world_size() as f32;

    let mut offset = 0;
    for param in parameters.iter() {
        let numel = param.numel();
        let slice = &flat[offset..offset + numel];
        offset += numel;
        let mut grad = param.grad();
        if !grad.defined() && slice.iter().all(|value| *value == 0.0) {
            continue;
        }
        let averaged = slice
            .iter()
            .map(|value| value / world_size)
            .collect::<Vec<f32>>();
        let averaged = Tensor::from_slice(&averaged)
            .view(param.size().as_slice())
            .to_kind(param.kind())
            .to_device(param.device());
        if grad.defined() {
            no_grad(|| grad.copy_(&averaged));
        } else {
            // unused on this rank: accumulating d(param . averaged) / d(param) defines the gradient
            (*param * &averaged).sum(Kind::Float).backward();
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use std::thread;

    #[test]
    fn single_process_is_identity() -> anyhow::Result<()> {
        let mut values = [1.0f32, 2.0];
        SingleProcess.all_reduce_sum(&mut values)?;
        assert_eq!(values, [1.0, 2.0]);
        assert_eq!(
            all_reduce_statistics(&SingleProcess, 3.0, Some([5.0]))?,
            (3.0, Some([5.0]))
        );
        Ok(())
    }

    #[test]
    fn thread_group_sums_over_ranks() {
        let handles = ThreadGroup::new_group(3)
            .into_iter()
            .map(|group| {
                thread::spawn(move || {
                    let mut results = Vec::new();
                    for round in 0..4 {
                        let mut values = [group.rank() as f32, round as f32];
                        group.all_reduce_sum(&mut values).unwrap();
                        results.push(values);
                    }
                    let (mean, _) =
                        all_reduce_statistics::<0>(&group, group.rank() as f64, None).unwrap();
                    (results, mean)
                })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            let (results, mean) = handle.join().unwrap();
            for (round, values) in results.iter().enumerate() {
                assert_eq!(values[0], 3.0);
                assert_eq!(values[1], 3.0 * round as f32);
            }
            assert!((mean - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn statistics_missing_on_a_rank_do_not_break_the_group() {
        let handles = ThreadGroup::new_group(2)
            .into_iter()
            .map(|group| {
                thread::spawn(move || {
                    let partial = (group.rank() == 0).then_some([2.0, 4.0, 6.0]);
                    let first = all_reduce_statistics(&group, group.rank() as f64, partial);
                    let second = all_reduce_statistics::<3>(&group, 1.0, None);
                    (first.unwrap(), second.unwrap())
                })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            let ((shared, partial), (second_shared, second_partial)) = handle.join().unwrap();
            assert!((shared - 0.5).abs() < 1e-6);
            assert_eq!(partial, Some([2.0, 4.0, 6.0]));
            assert!((second_shared - 1.0).abs() < 1e-6);
            assert_eq!(second_partial, None);
        }
    }

    #[test]
    fn gradients_unused_on_a_rank_are_averaged_in() {
        let handles = ThreadGroup::new_group(2)
            .into_iter()
            .map(|group| {
                thread::spawn(move || {
                    let param =
                        Tensor::zeros([2], (Kind::Float, Device::Cpu)).set_requires_grad(true);
                    if group.rank() == 0 {
                        (&param * Tensor::from_slice(&[2.0f32, 4.0]))
                            .sum(Kind::Float)
                            .backward();
                    }
                    all_reduce_gradients(&group, [&param]).unwrap();
                    Vec::<f32>::try_from(param.grad()).unwrap()
                })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), vec![1.0, 2.0]);
        }
    }
}
