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

/// # Running average of a scalar training statistic
/// Tracks the last value, the sum and count of observations (weighted by `n`) and their average.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AverageMeter {
    pub val: f64,
    pub avg: f64,
    pub sum: f64,
    pub count: usize,
}

impl AverageMeter {
    pub fn new() -> AverageMeter {
        AverageMeter::default()
    }

    pub fn reset(&mut self) {
        *self = AverageMeter::default();
    }

    /// Records `val` observed over `n` samples.
    pub fn update(&mut self, val: f64, n: usize) {
        self.val = val;
        self.sum += val * n as f64;
        self.count += n;
        if self.count > 0 {
            self.avg = self.sum / self.count as f64;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn average_is_weighted_by_sample_count() {
        let mut meter = AverageMeter::new();
        meter.update(1.0, 1);
        meter.update(4.0, 3);
        assert_eq!(meter.val, 4.0);
        assert_eq!(meter.count, 4);
        assert!((meter.avg - 13.0 / 4.0).abs() < 1e-12);
    }

    #[test]
    fn empty_update_keeps_average() {
        let mut meter = AverageMeter::new();
        meter.update(2.0, 0);
        assert_eq!(meter.avg, 0.0);
        meter.update(2.0, 2);
        meter.reset();
        assert_eq!(meter, AverageMeter::default());
    }
}
