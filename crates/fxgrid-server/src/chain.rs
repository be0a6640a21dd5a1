//! Effect chain and channel mapping.
//!
//! The hosting engine is reached through three seams: [`PluginLoader`] turns a
//! plugin id into an [`EffectProcessor`], an [`EffectChain`] orders processors
//! and runs them each block, and a [`ChannelMapper`] moves samples between the
//! client's sparse channel layout and the dense layout the chain sees.

use fxgrid_protocol::{
    ActiveChannels, AudioBlock, HandshakeRequest, MidiBuffer, PluginDescription, Result, Sample,
};

/// Session layout a processor is prepared for.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProcessingLayout {
    pub sample_rate: f64,
    pub block_size: usize,
    pub inputs: usize,
    pub outputs: usize,
    pub sidechain: usize,
}

impl ProcessingLayout {
    pub fn from_request(request: &HandshakeRequest) -> Self {
        Self {
            sample_rate: request.sample_rate,
            block_size: request.block_size as usize,
            inputs: request.channels_in as usize,
            outputs: request.channels_out as usize,
            sidechain: request.channels_sc as usize,
        }
    }
}

/// One loaded effect.
pub trait EffectProcessor: Send {
    fn description(&self) -> &PluginDescription;

    fn prepare(&mut self, layout: &ProcessingLayout);

    fn latency_samples(&self) -> usize {
        0
    }

    fn supports_f64(&self) -> bool {
        self.description().supports_f64
    }

    fn process_f32(&mut self, block: &mut AudioBlock<f32>, midi: &mut MidiBuffer);

    /// Only called when [`supports_f64`](Self::supports_f64) is true.
    fn process_f64(&mut self, block: &mut AudioBlock<f64>, midi: &mut MidiBuffer);

    fn num_parameters(&self) -> usize {
        0
    }

    fn parameter_value(&self, _index: usize) -> Option<f32> {
        None
    }

    /// Refreshes state that changed outside of processing.
    fn update(&mut self) {}
}

/// Creates processors from plugin ids.
pub trait PluginLoader: Send + Sync {
    fn load(&self, id: &str, layout: &ProcessingLayout) -> Result<Box<dyn EffectProcessor>>;
}

/// Ordered processors driven once per block.
pub trait EffectChain: Send {
    fn add(&mut self, processor: Box<dyn EffectProcessor>);

    fn remove(&mut self, index: usize) -> Option<Box<dyn EffectProcessor>>;

    /// Swaps two slots. False if either index is out of range.
    fn exchange(&mut self, a: usize, b: usize) -> bool;

    fn size(&self) -> usize;

    fn latency_samples(&self) -> usize;

    fn processor(&self, index: usize) -> Option<&dyn EffectProcessor>;

    fn parameter_value(&self, index: usize, param: usize) -> Option<f32>;

    fn is_sidechain_disabled(&self) -> bool;

    fn process_f32(&mut self, block: &mut AudioBlock<f32>, midi: &mut MidiBuffer);

    fn process_f64(&mut self, block: &mut AudioBlock<f64>, midi: &mut MidiBuffer);

    fn clear(&mut self);

    fn update(&mut self);
}

/// Dispatches a block to the chain entry point of its precision.
pub trait ChainSample: Sample {
    fn process_chain(chain: &mut dyn EffectChain, block: &mut AudioBlock<Self>, midi: &mut MidiBuffer);
}

impl ChainSample for f32 {
    fn process_chain(chain: &mut dyn EffectChain, block: &mut AudioBlock<f32>, midi: &mut MidiBuffer) {
        chain.process_f32(block, midi);
    }
}

impl ChainSample for f64 {
    fn process_chain(chain: &mut dyn EffectChain, block: &mut AudioBlock<f64>, midi: &mut MidiBuffer) {
        chain.process_f64(block, midi);
    }
}

/// Default chain: processors in a vector, run in order.
///
/// Processors without double precision support get a converted copy of the
/// block in a double-precision session.
pub struct ProcessorChain {
    processors: Vec<Box<dyn EffectProcessor>>,
    layout: ProcessingLayout,
    convert: AudioBlock<f32>,
}

impl ProcessorChain {
    pub fn new(layout: ProcessingLayout) -> Self {
        Self {
            processors: Vec::new(),
            layout,
            convert: AudioBlock::new(layout.inputs.max(layout.outputs), layout.block_size),
        }
    }

    pub fn layout(&self) -> &ProcessingLayout {
        &self.layout
    }
}

impl EffectChain for ProcessorChain {
    fn add(&mut self, processor: Box<dyn EffectProcessor>) {
        self.processors.push(processor);
    }

    fn remove(&mut self, index: usize) -> Option<Box<dyn EffectProcessor>> {
        if index < self.processors.len() {
            Some(self.processors.remove(index))
        } else {
            None
        }
    }

    fn exchange(&mut self, a: usize, b: usize) -> bool {
        if a < self.processors.len() && b < self.processors.len() {
            self.processors.swap(a, b);
            true
        } else {
            false
        }
    }

    fn size(&self) -> usize {
        self.processors.len()
    }

    fn latency_samples(&self) -> usize {
        self.processors.iter().map(|p| p.latency_samples()).sum()
    }

    fn processor(&self, index: usize) -> Option<&dyn EffectProcessor> {
        self.processors.get(index).map(|p| p.as_ref())
    }

    fn parameter_value(&self, index: usize, param: usize) -> Option<f32> {
        self.processors.get(index)?.parameter_value(param)
    }

    fn is_sidechain_disabled(&self) -> bool {
        let wanted = self.layout.inputs + self.layout.sidechain;
        self.layout.sidechain > 0
            && self
                .processors
                .iter()
                .any(|p| (p.description().num_inputs as usize) < wanted)
    }

    fn process_f32(&mut self, block: &mut AudioBlock<f32>, midi: &mut MidiBuffer) {
        for processor in &mut self.processors {
            processor.process_f32(block, midi);
        }
    }

    fn process_f64(&mut self, block: &mut AudioBlock<f64>, midi: &mut MidiBuffer) {
        for processor in &mut self.processors {
            if processor.supports_f64() {
                processor.process_f64(block, midi);
                continue;
            }
            self.convert
                .ensure_size(block.num_channels(), block.num_samples());
            for ch in 0..block.num_channels() {
                for (dst, &src) in self.convert.channel_mut(ch).iter_mut().zip(block.channel(ch)) {
                    *dst = src as f32;
                }
            }
            processor.process_f32(&mut self.convert, midi);
            for ch in 0..block.num_channels() {
                for (dst, &src) in block.channel_mut(ch).iter_mut().zip(self.convert.channel(ch)) {
                    *dst = src as f64;
                }
            }
        }
    }

    fn clear(&mut self) {
        self.processors.clear();
    }

    fn update(&mut self) {
        for processor in &mut self.processors {
            processor.update();
        }
    }
}

/// Moves samples between the client layout and the chain's dense layout.
pub trait ChannelMapper {
    /// Channel count of the dense block.
    fn dense_channels(&self) -> usize;

    fn map_to_dense<T: Sample>(&self, client: &AudioBlock<T>, dense: &mut AudioBlock<T>);

    fn map_from_dense<T: Sample>(&self, dense: &AudioBlock<T>, client: &mut AudioBlock<T>);
}

/// Packs the active input channels (main then sidechain) to the front of the
/// dense block. Outputs come back one to one; client channels past the output
/// count are zeroed.
#[derive(Debug, Clone)]
pub struct ActiveChannelMapper {
    active_inputs: Vec<usize>,
    outputs: usize,
    dense_channels: usize,
}

impl ActiveChannelMapper {
    pub fn new(input_channels: usize, outputs: usize, active: ActiveChannels) -> Self {
        let active_inputs: Vec<usize> = active.iter_below(input_channels).collect();
        let dense_channels = active_inputs.len().max(outputs);
        Self {
            active_inputs,
            outputs,
            dense_channels,
        }
    }

    pub fn from_request(request: &HandshakeRequest) -> Self {
        Self::new(
            request.input_channels(),
            request.channels_out as usize,
            request.active_channels,
        )
    }

    pub fn active_inputs(&self) -> &[usize] {
        &self.active_inputs
    }
}

impl ChannelMapper for ActiveChannelMapper {
    fn dense_channels(&self) -> usize {
        self.dense_channels
    }

    fn map_to_dense<T: Sample>(&self, client: &AudioBlock<T>, dense: &mut AudioBlock<T>) {
        dense.ensure_size(self.dense_channels, client.num_samples());
        for (dense_ch, &client_ch) in self.active_inputs.iter().enumerate() {
            if client_ch < client.num_channels() {
                dense.channel_mut(dense_ch).copy_from_slice(client.channel(client_ch));
            } else {
                dense.channel_mut(dense_ch).fill(T::default());
            }
        }
        for dense_ch in self.active_inputs.len()..self.dense_channels {
            dense.channel_mut(dense_ch).fill(T::default());
        }
    }

    fn map_from_dense<T: Sample>(&self, dense: &AudioBlock<T>, client: &mut AudioBlock<T>) {
        let copied = self.outputs.min(client.num_channels()).min(dense.num_channels());
        for ch in 0..copied {
            client.channel_mut(ch).copy_from_slice(dense.channel(ch));
        }
        for ch in copied..client.num_channels() {
            client.channel_mut(ch).fill(T::default());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fxgrid_protocol::PluginFormat;

    struct Scale {
        desc: PluginDescription,
        factor: f32,
        latency: usize,
    }

    impl Scale {
        fn boxed(name: &str, factor: f32, f64_support: bool) -> Box<dyn EffectProcessor> {
            Box::new(Self {
                desc: PluginDescription::new(name, PluginFormat::Builtin, name)
                    .f64_support(f64_support),
                factor,
                latency: 4,
            })
        }
    }

    impl EffectProcessor for Scale {
        fn description(&self) -> &PluginDescription {
            &self.desc
        }

        fn prepare(&mut self, _layout: &ProcessingLayout) {}

        fn latency_samples(&self) -> usize {
            self.latency
        }

        fn process_f32(&mut self, block: &mut AudioBlock<f32>, _midi: &mut MidiBuffer) {
            for ch in block.channels_mut() {
                ch.iter_mut().for_each(|s| *s *= self.factor);
            }
        }

        fn process_f64(&mut self, block: &mut AudioBlock<f64>, _midi: &mut MidiBuffer) {
            for ch in block.channels_mut() {
                ch.iter_mut().for_each(|s| *s *= self.factor as f64);
            }
        }

        fn num_parameters(&self) -> usize {
            1
        }

        fn parameter_value(&self, index: usize) -> Option<f32> {
            (index == 0).then_some(self.factor)
        }
    }

    fn layout(sidechain: usize) -> ProcessingLayout {
        ProcessingLayout {
            sample_rate: 48000.0,
            block_size: 64,
            inputs: 2,
            outputs: 2,
            sidechain,
        }
    }

    #[test]
    fn test_chain_order_and_queries() {
        let mut chain = ProcessorChain::new(layout(0));
        chain.add(Scale::boxed("a", 2.0, true));
        chain.add(Scale::boxed("b", 3.0, true));
        assert_eq!(chain.size(), 2);
        assert_eq!(chain.latency_samples(), 8);
        assert_eq!(chain.parameter_value(1, 0), Some(3.0));
        assert_eq!(chain.parameter_value(5, 0), None);

        assert!(chain.exchange(0, 1));
        assert_eq!(chain.processor(0).unwrap().description().name, "b");
        assert!(!chain.exchange(0, 2));

        assert!(chain.remove(3).is_none());
        assert_eq!(chain.remove(0).unwrap().description().name, "b");
        chain.clear();
        assert_eq!(chain.size(), 0);
    }

    #[test]
    fn test_chain_process_f64_converts_for_f32_only() {
        let mut chain = ProcessorChain::new(layout(0));
        chain.add(Scale::boxed("single", 0.5, false));
        chain.add(Scale::boxed("double", 4.0, true));

        let mut block = AudioBlock::from_channels(vec![vec![1.0f64; 8], vec![-1.0; 8]]);
        chain.process_f64(&mut block, &mut MidiBuffer::new());
        assert_eq!(block.channel(0), &[2.0; 8]);
        assert_eq!(block.channel(1), &[-2.0; 8]);
    }

    #[test]
    fn test_sidechain_disabled_when_processor_lacks_inputs() {
        let mut chain = ProcessorChain::new(layout(2));
        assert!(!chain.is_sidechain_disabled());
        chain.add(Scale::boxed("stereo", 1.0, false));
        assert!(chain.is_sidechain_disabled());

        let mut plain = ProcessorChain::new(layout(0));
        plain.add(Scale::boxed("stereo", 1.0, false));
        assert!(!plain.is_sidechain_disabled());
    }

    #[test]
    fn test_mapper_packs_active_channels() {
        let mut active = ActiveChannels::default();
        active.set_active(1, true);
        active.set_active(3, true);
        let mapper = ActiveChannelMapper::new(4, 2, active);
        assert_eq!(mapper.dense_channels(), 2);

        let client = AudioBlock::from_channels(vec![
            vec![0.0f32; 4],
            vec![1.0; 4],
            vec![2.0; 4],
            vec![3.0; 4],
        ]);
        let mut dense = AudioBlock::default();
        mapper.map_to_dense(&client, &mut dense);
        assert_eq!(dense.num_channels(), 2);
        assert_eq!(dense.channel(0), &[1.0; 4]);
        assert_eq!(dense.channel(1), &[3.0; 4]);
    }

    #[test]
    fn test_mapper_zeroes_unused_client_channels() {
        let mapper = ActiveChannelMapper::new(4, 2, ActiveChannels::all(4));
        assert_eq!(mapper.dense_channels(), 4);

        let dense = AudioBlock::from_channels(vec![vec![0.5f64; 4]; 4]);
        let mut client = AudioBlock::from_channels(vec![vec![9.0f64; 4]; 4]);
        mapper.map_from_dense(&dense, &mut client);
        assert_eq!(client.channel(0), &[0.5; 4]);
        assert_eq!(client.channel(1), &[0.5; 4]);
        assert_eq!(client.channel(2), &[0.0; 4]);
        assert_eq!(client.channel(3), &[0.0; 4]);
    }

    #[test]
    fn test_mapper_more_outputs_than_active_inputs() {
        let mapper = ActiveChannelMapper::new(1, 2, ActiveChannels::all(1));
        assert_eq!(mapper.dense_channels(), 2);

        let client = AudioBlock::from_channels(vec![vec![0.25f32; 2], vec![7.0; 2]]);
        let mut dense = AudioBlock::default();
        mapper.map_to_dense(&client, &mut dense);
        assert_eq!(dense.channel(0), &[0.25; 2]);
        assert_eq!(dense.channel(1), &[0.0; 2]);
    }
}
