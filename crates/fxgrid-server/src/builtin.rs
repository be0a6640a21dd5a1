//! Processors compiled into the server.
//!
//! Ids take the form `builtin:<name>` with optional query parameters, for
//! example `builtin:gain?db=-6` or `builtin:delay?samples=64`.

use crate::catalog::FormatScanner;
use crate::chain::{EffectProcessor, PluginLoader, ProcessingLayout};
use crate::config::ServerConfig;
use fxgrid_protocol::{
    AudioBlock, GridError, MidiBuffer, PluginDescription, PluginFormat, Result, Sample,
};

pub const PASSTHROUGH_ID: &str = "builtin:passthrough";
pub const GAIN_ID: &str = "builtin:gain";
pub const DELAY_ID: &str = "builtin:delay";

const VENDOR: &str = "fxgrid";

/// Longest delay line, in seconds at the session rate.
pub const MAX_DELAY_SECONDS: f64 = 10.0;

fn describe_builtin(name: &str) -> Option<PluginDescription> {
    let (display, unique_id, category) = match name {
        "passthrough" => ("Passthrough", 1, "Utility"),
        "gain" => ("Gain", 2, "Dynamics"),
        "delay" => ("Delay", 3, "Delay"),
        _ => return None,
    };
    Some(
        PluginDescription::new(display, PluginFormat::Builtin, format!("builtin:{}", name))
            .unique_id(unique_id)
            .vendor(VENDOR)
            .category(category)
            .f64_support(true),
    )
}

/// Splits `builtin:<name>?k=v&k=v` into the name and its parameters.
fn parse_id(id: &str) -> Option<(&str, Vec<(&str, &str)>)> {
    let rest = id.strip_prefix("builtin:")?;
    let (name, query) = rest.split_once('?').unwrap_or((rest, ""));
    let params = query
        .split('&')
        .filter(|kv| !kv.is_empty())
        .map(|kv| kv.split_once('=').unwrap_or((kv, "")))
        .collect();
    Some((name, params))
}

fn load_failed(id: &str, reason: impl Into<String>) -> GridError {
    GridError::LoadFailed {
        id: id.to_string(),
        reason: reason.into(),
    }
}

fn param<T: std::str::FromStr>(
    id: &str,
    params: &[(&str, &str)],
    key: &str,
    default: T,
) -> Result<T> {
    match params.iter().find(|(k, _)| *k == key) {
        Some((_, v)) => v
            .parse()
            .map_err(|_| load_failed(id, format!("invalid value '{}' for '{}'", v, key))),
        None => Ok(default),
    }
}

pub struct Passthrough {
    desc: PluginDescription,
}

impl EffectProcessor for Passthrough {
    fn description(&self) -> &PluginDescription {
        &self.desc
    }

    fn prepare(&mut self, _layout: &ProcessingLayout) {}

    fn process_f32(&mut self, _block: &mut AudioBlock<f32>, _midi: &mut MidiBuffer) {}

    fn process_f64(&mut self, _block: &mut AudioBlock<f64>, _midi: &mut MidiBuffer) {}
}

/// Static gain in decibels. Parameter 0 reports the gain in dB.
pub struct Gain {
    desc: PluginDescription,
    gain_db: f64,
    factor: f64,
}

impl Gain {
    pub fn new(gain_db: f64) -> Self {
        let desc = describe_builtin("gain").unwrap_or_else(|| {
            PluginDescription::new("Gain", PluginFormat::Builtin, GAIN_ID)
        });
        Self {
            desc,
            gain_db,
            factor: 10f64.powf(gain_db / 20.0),
        }
    }

    fn apply<T: Sample>(&self, block: &mut AudioBlock<T>) {
        for ch in block.channels_mut() {
            for s in ch.iter_mut() {
                *s = T::from_f64(s.to_f64() * self.factor);
            }
        }
    }
}

impl EffectProcessor for Gain {
    fn description(&self) -> &PluginDescription {
        &self.desc
    }

    fn prepare(&mut self, _layout: &ProcessingLayout) {}

    fn process_f32(&mut self, block: &mut AudioBlock<f32>, _midi: &mut MidiBuffer) {
        self.apply(block);
    }

    fn process_f64(&mut self, block: &mut AudioBlock<f64>, _midi: &mut MidiBuffer) {
        self.apply(block);
    }

    fn num_parameters(&self) -> usize {
        1
    }

    fn parameter_value(&self, index: usize) -> Option<f32> {
        (index == 0).then_some(self.gain_db as f32)
    }
}

/// Fixed delay reporting its length as latency.
pub struct Delay {
    desc: PluginDescription,
    samples: usize,
    lines: Vec<Vec<f64>>,
    pos: usize,
}

impl Delay {
    pub fn new(samples: usize) -> Self {
        let desc = describe_builtin("delay").unwrap_or_else(|| {
            PluginDescription::new("Delay", PluginFormat::Builtin, DELAY_ID)
        });
        Self {
            desc,
            samples,
            lines: Vec::new(),
            pos: 0,
        }
    }

    fn apply<T: Sample>(&mut self, block: &mut AudioBlock<T>) {
        if self.samples == 0 {
            return;
        }
        while self.lines.len() < block.num_channels() {
            self.lines.push(vec![0.0; self.samples]);
        }
        let start = self.pos;
        let mut end = start;
        for (ch, line) in block.channels_mut().zip(self.lines.iter_mut()) {
            let mut pos = start;
            for s in ch.iter_mut() {
                let delayed = line[pos];
                line[pos] = s.to_f64();
                *s = T::from_f64(delayed);
                pos = (pos + 1) % self.samples;
            }
            end = pos;
        }
        self.pos = end;
    }
}

impl EffectProcessor for Delay {
    fn description(&self) -> &PluginDescription {
        &self.desc
    }

    fn prepare(&mut self, layout: &ProcessingLayout) {
        let channels = (layout.inputs + layout.sidechain).max(layout.outputs);
        self.lines = vec![vec![0.0; self.samples]; channels];
        self.pos = 0;
    }

    fn latency_samples(&self) -> usize {
        self.samples
    }

    fn process_f32(&mut self, block: &mut AudioBlock<f32>, _midi: &mut MidiBuffer) {
        self.apply(block);
    }

    fn process_f64(&mut self, block: &mut AudioBlock<f64>, _midi: &mut MidiBuffer) {
        self.apply(block);
    }

    fn num_parameters(&self) -> usize {
        1
    }

    fn parameter_value(&self, index: usize) -> Option<f32> {
        (index == 0).then_some(self.samples as f32)
    }
}

/// Loads `builtin:` ids. Anything else fails to load.
#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinLoader;

impl PluginLoader for BuiltinLoader {
    fn load(&self, id: &str, layout: &ProcessingLayout) -> Result<Box<dyn EffectProcessor>> {
        let (name, params) = parse_id(id).ok_or_else(|| load_failed(id, "unknown plugin"))?;
        let mut processor: Box<dyn EffectProcessor> = match name {
            "passthrough" => Box::new(Passthrough {
                desc: describe_builtin(name).ok_or_else(|| load_failed(id, "unknown plugin"))?,
            }),
            "gain" => Box::new(Gain::new(param(id, &params, "db", 0.0)?)),
            "delay" => {
                let samples = param(id, &params, "samples", 0usize)?;
                let max = (layout.sample_rate * MAX_DELAY_SECONDS) as usize;
                if samples > max {
                    return Err(load_failed(
                        id,
                        format!(
                            "delay of {} samples exceeds {}s at {} Hz",
                            samples, MAX_DELAY_SECONDS, layout.sample_rate
                        ),
                    ));
                }
                Box::new(Delay::new(samples))
            }
            _ => return Err(load_failed(id, "unknown built-in processor")),
        };
        processor.prepare(layout);
        Ok(processor)
    }
}

/// Reports the built-in processors to the catalog.
#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinScanner;

impl FormatScanner for BuiltinScanner {
    fn format(&self) -> PluginFormat {
        PluginFormat::Builtin
    }

    fn search(&self, _config: &ServerConfig) -> Vec<String> {
        vec![
            PASSTHROUGH_ID.to_string(),
            GAIN_ID.to_string(),
            DELAY_ID.to_string(),
        ]
    }

    fn describe(&self, id: &str) -> Result<Vec<PluginDescription>> {
        parse_id(id)
            .and_then(|(name, _)| describe_builtin(name))
            .map(|desc| vec![desc])
            .ok_or_else(|| GridError::ScanFailed {
                id: id.to_string(),
                reason: "not a built-in processor".to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> ProcessingLayout {
        ProcessingLayout {
            sample_rate: 44100.0,
            block_size: 8,
            inputs: 1,
            outputs: 1,
            sidechain: 0,
        }
    }

    #[test]
    fn test_delay_longer_than_limit_fails_to_load() {
        let id = "builtin:delay?samples=1099511627776";
        match BuiltinLoader.load(id, &layout()) {
            Err(GridError::LoadFailed { reason, .. }) => assert!(reason.contains("exceeds")),
            Err(other) => panic!("Expected LoadFailed, got {:?}", other),
            Ok(_) => panic!("Expected LoadFailed"),
        }
        assert!(BuiltinLoader.load("builtin:delay?samples=441000", &layout()).is_ok());
        assert!(BuiltinLoader.load("builtin:delay?samples=441001", &layout()).is_err());
    }

    #[test]
    fn test_parse_id() {
        let (name, params) = parse_id("builtin:gain?db=-6&x=1").unwrap();
        assert_eq!(name, "gain");
        assert_eq!(params, vec![("db", "-6"), ("x", "1")]);
        assert!(parse_id("vst3:/plugins/x.vst3").is_none());
    }

    #[test]
    fn test_load_unknown_ids() {
        for id in ["bad-id", "builtin:reverb", "builtin:gain?db=loud"] {
            match BuiltinLoader.load(id, &layout()) {
                Err(GridError::LoadFailed { id: failed, reason }) => {
                    assert_eq!(failed, id);
                    assert!(!reason.is_empty());
                }
                Err(other) => panic!("Expected LoadFailed for {}, got {:?}", id, other),
                Ok(_) => panic!("Expected LoadFailed for {}", id),
            }
        }
    }

    #[test]
    fn test_gain_db() {
        let mut gain = BuiltinLoader.load("builtin:gain?db=-6.0206", &layout()).unwrap();
        assert_eq!(gain.description().file_or_identifier, GAIN_ID);
        assert!((gain.parameter_value(0).unwrap() + 6.0206).abs() < 1e-4);

        let mut block = AudioBlock::from_channels(vec![vec![1.0f32; 4]]);
        gain.process_f32(&mut block, &mut MidiBuffer::new());
        assert!(block.channel(0).iter().all(|&s| (s - 0.5).abs() < 1e-4));
    }

    #[test]
    fn test_delay_latency_and_output() {
        let mut delay = BuiltinLoader.load("builtin:delay?samples=3", &layout()).unwrap();
        assert_eq!(delay.latency_samples(), 3);

        let mut block = AudioBlock::from_channels(vec![vec![1.0f64, 2.0, 3.0, 4.0, 5.0]]);
        delay.process_f64(&mut block, &mut MidiBuffer::new());
        assert_eq!(block.channel(0), &[0.0, 0.0, 0.0, 1.0, 2.0]);

        let mut next = AudioBlock::from_channels(vec![vec![0.0f64; 3]]);
        delay.process_f64(&mut next, &mut MidiBuffer::new());
        assert_eq!(next.channel(0), &[3.0, 4.0, 5.0]);
    }

    #[test]
    fn test_scanner_describes_builtins() {
        let ids = BuiltinScanner.search(&ServerConfig::default());
        assert_eq!(ids.len(), 3);
        for id in &ids {
            let descs = BuiltinScanner.describe(id).unwrap();
            assert_eq!(descs[0].file_or_identifier, *id);
        }
        assert!(BuiltinScanner.describe("builtin:nope").is_err());
    }
}
