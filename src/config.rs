// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Machine layout of the VM, loaded from a JSON file.

use std::collections::BTreeMap;
use std::fmt;
use std::fmt::Display;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use anyhow::anyhow;
use anyhow::bail;
use anyhow::Context;
use devices::irqchip::GICD_SIZE;
use devices::irqchip::NUM_IRQS;
use devices::irqchip::NUM_PRIVATE_IRQS;
use devices::virtio::VIRTIO_MMIO_REGION_SZ;
use devices::PL011_AMBA_IOMEM_SIZE;
use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;
use serde::Serializer;

/// Largest virtqueue the split ring layout allows.
const MAX_QUEUE_SIZE: u16 = 32768;

/// A 48-bit Ethernet address, written as six colon separated hex bytes.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct MacAddress(pub [u8; 6]);

impl FromStr for MacAddress {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let mut addr = [0u8; 6];
        let mut parts = s.split(':');
        for byte in addr.iter_mut() {
            let part = parts
                .next()
                .ok_or_else(|| anyhow!("mac address `{}` is too short", s))?;
            *byte = u8::from_str_radix(part, 16)
                .with_context(|| format!("invalid byte `{}` in mac address `{}`", part, s))?;
        }
        if parts.next().is_some() {
            bail!("mac address `{}` is too long", s);
        }
        Ok(MacAddress(addr))
    }
}

impl Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let a = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            a[0], a[1], a[2], a[3], a[4], a[5]
        )
    }
}

impl Serialize for MacAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MacAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields, default)]
pub struct GicConfig {
    pub distributor_base: u64,
}

impl Default for GicConfig {
    fn default() -> Self {
        GicConfig {
            distributor_base: 0x0800_0000,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields, default)]
pub struct TimerConfig {
    /// Frequency of the guest counter, reported in CNTFRQ_EL0.
    pub frequency_hz: u64,
}

impl Default for TimerConfig {
    fn default() -> Self {
        TimerConfig {
            frequency_hz: 62_500_000,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields, default)]
pub struct UartConfig {
    pub base: u64,
    pub irq: u32,
}

impl Default for UartConfig {
    fn default() -> Self {
        UartConfig {
            base: 0x0900_0000,
            irq: 33,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ConsoleConfig {
    pub base: u64,
    pub irq: u32,
    #[serde(default = "default_queue_size")]
    pub queue_size: u16,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct NetConfig {
    pub base: u64,
    pub irq: u32,
    #[serde(default = "default_queue_size")]
    pub queue_size: u16,
    pub mac: MacAddress,
}

fn default_queue_size() -> u16 {
    256
}

/// Everything needed to lay out the machine.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields, default)]
pub struct VmConfig {
    pub mem_base: u64,
    pub mem_size: u64,
    pub gic: GicConfig,
    pub timer: TimerConfig,
    pub uart: UartConfig,
    pub console: Option<ConsoleConfig>,
    pub net: Option<NetConfig>,
    /// Values replacing the defaults of emulated ID registers, keyed by register name.
    pub cpu_id_overrides: BTreeMap<String, u64>,
    /// Log filter in env_logger syntax.
    pub log: String,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            mem_base: 0x4000_0000,
            mem_size: 128 << 20,
            gic: Default::default(),
            timer: Default::default(),
            uart: Default::default(),
            console: None,
            net: None,
            cpu_id_overrides: BTreeMap::new(),
            log: "info".to_string(),
        }
    }
}

// An address window claimed by the memory or a device.
struct Window {
    name: &'static str,
    base: u64,
    size: u64,
}

impl Window {
    fn end(&self) -> u64 {
        self.base + self.size
    }
}

fn validate_spi(name: &str, irq: u32) -> anyhow::Result<()> {
    if !(NUM_PRIVATE_IRQS..NUM_IRQS).contains(&irq) {
        bail!(
            "{} interrupt {} is outside the SPI range {}..{}",
            name,
            irq,
            NUM_PRIVATE_IRQS,
            NUM_IRQS
        );
    }
    Ok(())
}

fn validate_queue_size(name: &str, size: u16) -> anyhow::Result<()> {
    if size == 0 || !size.is_power_of_two() || size > MAX_QUEUE_SIZE {
        bail!(
            "{} queue size {} must be a power of two between 1 and {}",
            name,
            size,
            MAX_QUEUE_SIZE
        );
    }
    Ok(())
}

impl VmConfig {
    /// Loads and validates the configuration stored as JSON at `path`.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> anyhow::Result<VmConfig> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: VmConfig = serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("invalid config file {}", path.display()))?;
        Ok(config)
    }

    fn windows(&self) -> Vec<Window> {
        let mut windows = vec![
            Window {
                name: "memory",
                base: self.mem_base,
                size: self.mem_size,
            },
            Window {
                name: "gic distributor",
                base: self.gic.distributor_base,
                size: GICD_SIZE,
            },
            Window {
                name: "uart",
                base: self.uart.base,
                size: PL011_AMBA_IOMEM_SIZE,
            },
        ];
        if let Some(console) = &self.console {
            windows.push(Window {
                name: "virtio console",
                base: console.base,
                size: VIRTIO_MMIO_REGION_SZ,
            });
        }
        if let Some(net) = &self.net {
            windows.push(Window {
                name: "virtio net",
                base: net.base,
                size: VIRTIO_MMIO_REGION_SZ,
            });
        }
        windows
    }

    /// Checks the layout for conflicts the devices could not detect on their own.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.mem_size == 0 {
            bail!("guest memory size must not be zero");
        }
        if self.timer.frequency_hz < 1000 {
            bail!(
                "timer frequency of {} Hz is too low, at least 1 kHz is needed",
                self.timer.frequency_hz
            );
        }

        let windows = self.windows();
        for w in &windows {
            if w.base.checked_add(w.size).is_none() {
                bail!("{} window at {:#x} wraps the address space", w.name, w.base);
            }
        }
        for (i, a) in windows.iter().enumerate() {
            for b in &windows[i + 1..] {
                if a.base < b.end() && b.base < a.end() {
                    bail!(
                        "{} window {:#x}..{:#x} overlaps {} window {:#x}..{:#x}",
                        a.name,
                        a.base,
                        a.end(),
                        b.name,
                        b.base,
                        b.end()
                    );
                }
            }
        }

        let mut irqs = vec![("uart", self.uart.irq)];
        if let Some(console) = &self.console {
            validate_queue_size("virtio console", console.queue_size)?;
            irqs.push(("virtio console", console.irq));
        }
        if let Some(net) = &self.net {
            validate_queue_size("virtio net", net.queue_size)?;
            irqs.push(("virtio net", net.irq));
        }
        for (i, (name, irq)) in irqs.iter().enumerate() {
            validate_spi(name, *irq)?;
            if let Some((other, _)) = irqs[i + 1..].iter().find(|(_, o)| o == irq) {
                bail!("{} and {} share interrupt {}", name, other, irq);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;

    fn write_config(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn defaults_are_valid() {
        VmConfig::default().validate().unwrap();
    }

    #[test]
    fn load_full_config() {
        let file = write_config(
            r#"{
                "mem_base": 1073741824,
                "mem_size": 67108864,
                "gic": { "distributor_base": 134217728 },
                "timer": { "frequency_hz": 24000000 },
                "uart": { "base": 150994944, "irq": 33 },
                "console": { "base": 167772160, "irq": 48 },
                "net": { "base": 167772672, "irq": 49, "queue_size": 128, "mac": "52:54:00:12:34:56" },
                "cpu_id_overrides": { "MIDR_EL1": 1090915587 },
                "log": "devices=debug"
            }"#,
        );
        let config = VmConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.mem_size, 64 << 20);
        assert_eq!(config.timer.frequency_hz, 24_000_000);
        assert_eq!(config.console.as_ref().unwrap().queue_size, 256);
        let net = config.net.as_ref().unwrap();
        assert_eq!(net.queue_size, 128);
        assert_eq!(net.mac, MacAddress([0x52, 0x54, 0x00, 0x12, 0x34, 0x56]));
        assert_eq!(config.cpu_id_overrides["MIDR_EL1"], 0x4106_0d03);
        assert_eq!(config.log, "devices=debug");
    }

    #[test]
    fn missing_fields_take_defaults() {
        let file = write_config(r#"{ "mem_size": 16777216 }"#);
        let config = VmConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.mem_size, 16 << 20);
        assert_eq!(config.uart, UartConfig::default());
        assert!(config.console.is_none());
    }

    #[test]
    fn unknown_field_is_rejected() {
        let file = write_config(r#"{ "cpus": 2 }"#);
        let err = VmConfig::from_json_file(file.path()).unwrap_err();
        assert!(format!("{:#}", err).contains("unknown field"));
    }

    #[test]
    fn missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = VmConfig::from_json_file(dir.path().join("vm.json")).unwrap_err();
        assert!(err.to_string().contains("failed to read config file"));
    }

    #[test]
    fn overlapping_windows() {
        let mut config = VmConfig::default();
        config.console = Some(ConsoleConfig {
            base: config.uart.base + 0x800,
            irq: 48,
            queue_size: 256,
        });
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("overlaps"));

        let mut config = VmConfig::default();
        config.gic.distributor_base = config.mem_base + 0x1000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn interrupts_must_be_distinct_spis() {
        let mut config = VmConfig::default();
        config.uart.irq = 27;
        assert!(config.validate().is_err());

        let mut config = VmConfig::default();
        config.uart.irq = NUM_IRQS;
        assert!(config.validate().is_err());

        let mut config = VmConfig::default();
        config.console = Some(ConsoleConfig {
            base: 0x0a00_0000,
            irq: config.uart.irq,
            queue_size: 256,
        });
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("share interrupt"));
    }

    #[test]
    fn queue_size_must_be_power_of_two() {
        let mut config = VmConfig::default();
        config.console = Some(ConsoleConfig {
            base: 0x0a00_0000,
            irq: 48,
            queue_size: 100,
        });
        assert!(config.validate().is_err());
        config.console.as_mut().unwrap().queue_size = 0;
        assert!(config.validate().is_err());
        config.console.as_mut().unwrap().queue_size = 64;
        config.validate().unwrap();
    }

    #[test]
    fn zero_timer_frequency() {
        let mut config = VmConfig::default();
        config.timer.frequency_hz = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn mac_address_parsing() {
        let mac: MacAddress = "02:00:00:aa:bb:0c".parse().unwrap();
        assert_eq!(mac.to_string(), "02:00:00:aa:bb:0c");
        assert!("02:00:00:aa:bb".parse::<MacAddress>().is_err());
        assert!("02:00:00:aa:bb:0c:01".parse::<MacAddress>().is_err());
        assert!("02:00:00:aa:bb:zz".parse::<MacAddress>().is_err());
    }
}
