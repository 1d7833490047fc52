/// Non-interleaved audio buffer used at the host boundary.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AudioBuffer {
    channels: Vec<Vec<f32>>,
}

impl AudioBuffer {
    pub fn new(num_channels: usize, frames: usize) -> Self {
        Self {
            channels: allocate_channels(num_channels, frames),
        }
    }

    pub fn clear(&mut self) {
        clear_channels(&mut self.channels);
    }

    pub fn frames(&self) -> usize {
        self.channels
            .first()
            .map(|channel| channel.len())
            .unwrap_or_default()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn channel(&self, index: usize) -> &[f32] {
        &self.channels[index]
    }

    pub fn channel_mut(&mut self, index: usize) -> &mut [f32] {
        &mut self.channels[index]
    }

    pub fn as_slice(&self) -> &[Vec<f32>] {
        &self.channels
    }

    pub fn as_mut_slice(&mut self) -> &mut [Vec<f32>] {
        &mut self.channels
    }
}

pub(crate) fn allocate_channels(num_channels: usize, frames: usize) -> Vec<Vec<f32>> {
    (0..num_channels).map(|_| vec![0.0; frames]).collect()
}

pub(crate) fn clear_channels(channels: &mut [Vec<f32>]) {
    for channel in channels {
        channel.fill(0.0);
    }
}

/// Zeroes the first `frames` samples of every channel.
pub(crate) fn silence(channels: &mut [Vec<f32>], frames: usize) {
    for channel in channels {
        let len = frames.min(channel.len());
        channel[..len].fill(0.0);
    }
}
