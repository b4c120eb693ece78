//! Audio device enumeration and lookup

use cpal::traits::{DeviceTrait, HostTrait};

use crate::error::AudioError;

/// Device summary printed by `--list-devices`
#[derive(Debug, Clone)]
pub struct AudioDeviceInfo {
    pub name: String,
    pub is_input: bool,
    pub is_output: bool,
    pub is_default: bool,
    pub sample_rates: Vec<u32>,
    pub channels: Vec<u16>,
}

/// List all available audio devices on the default host
pub fn list_devices() -> Vec<AudioDeviceInfo> {
    let host = cpal::default_host();
    let mut devices: Vec<AudioDeviceInfo> = Vec::new();

    let default_input_name = host.default_input_device().and_then(|d| d.name().ok());
    let default_output_name = host.default_output_device().and_then(|d| d.name().ok());

    if let Ok(inputs) = host.input_devices() {
        for device in inputs {
            let Ok(name) = device.name() else { continue };
            let (sample_rates, channels) = capabilities(&device, true);
            devices.push(AudioDeviceInfo {
                is_default: default_input_name.as_ref() == Some(&name),
                name,
                is_input: true,
                is_output: false,
                sample_rates,
                channels,
            });
        }
    }

    if let Ok(outputs) = host.output_devices() {
        for device in outputs {
            let Ok(name) = device.name() else { continue };
            let is_default = default_output_name.as_ref() == Some(&name);

            // Duplex devices show up once
            if let Some(existing) = devices.iter_mut().find(|d| d.name == name) {
                existing.is_output = true;
                existing.is_default |= is_default;
                continue;
            }

            let (sample_rates, channels) = capabilities(&device, false);
            devices.push(AudioDeviceInfo {
                name,
                is_input: false,
                is_output: true,
                is_default,
                sample_rates,
                channels,
            });
        }
    }

    devices
}

/// Common rates and channel counts a device supports
fn capabilities(device: &cpal::Device, is_input: bool) -> (Vec<u32>, Vec<u16>) {
    let ranges: Vec<cpal::SupportedStreamConfigRange> = if is_input {
        device
            .supported_input_configs()
            .map(|it| it.collect())
            .unwrap_or_default()
    } else {
        device
            .supported_output_configs()
            .map(|it| it.collect())
            .unwrap_or_default()
    };

    let mut rates = Vec::new();
    let mut channels = Vec::new();
    for range in &ranges {
        for rate in [16_000u32, 22_050, 44_100, 48_000, 96_000] {
            let r = cpal::SampleRate(rate);
            if r >= range.min_sample_rate() && r <= range.max_sample_rate() && !rates.contains(&rate) {
                rates.push(rate);
            }
        }
        if !channels.contains(&range.channels()) {
            channels.push(range.channels());
        }
    }
    rates.sort_unstable();
    channels.sort_unstable();
    (rates, channels)
}

/// Find an input device by exact name, or the default input when `name` is None
pub fn find_input_device(name: Option<&str>) -> Result<cpal::Device, AudioError> {
    let host = cpal::default_host();

    let Some(name) = name else {
        return host
            .default_input_device()
            .ok_or_else(|| AudioError::DeviceNotFound("no default input device".to_string()));
    };

    host.input_devices()?
        .find(|d| d.name().map(|n| n == name).unwrap_or(false))
        .ok_or_else(|| AudioError::DeviceNotFound(name.to_string()))
}

/// Render the device table the way the relay prints it at start-up
pub fn format_device_table(devices: &[AudioDeviceInfo]) -> String {
    let mut out = String::from("=== Available Audio Devices ===\n");
    for device in devices {
        let kind = match (device.is_input, device.is_output) {
            (true, true) => "Input/Output",
            (true, false) => "Input",
            (false, true) => "Output",
            _ => "Unknown",
        };
        let default_marker = if device.is_default { " [DEFAULT]" } else { "" };
        out.push_str(&format!("  {} ({}){}\n", device.name, kind, default_marker));
        out.push_str(&format!("    Sample rates: {:?}\n", device.sample_rates));
        out.push_str(&format!("    Channels: {:?}\n", device.channels));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_table() {
        let table = format_device_table(&[AudioDeviceInfo {
            name: "USB Mic".into(),
            is_input: true,
            is_output: false,
            is_default: true,
            sample_rates: vec![44_100, 48_000],
            channels: vec![1],
        }]);
        assert!(table.contains("USB Mic (Input) [DEFAULT]"));
        assert!(table.contains("[44100, 48000]"));
    }

    #[test]
    fn test_missing_named_device() {
        // Works with or without audio hardware: the name never exists
        let result = find_input_device(Some("no-such-device-for-voice-relay"));
        assert!(result.is_err());
    }
}
