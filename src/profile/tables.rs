//! 内置芯片和设备配置表 (顺序即优先级)

use super::{BoundsOverride, ChipProfile, DeviceOverride, TuningBounds, TuningCapability};

#[allow(clippy::too_many_arguments)]
fn chip_bounds(
    (min_freq, max_freq): (u32, u32),
    (min_volt, max_volt): (u32, u32),
    target_temp: f64,
    vr_target_temp: f64,
    (freq_step_up, freq_step_down): (u32, u32),
    (volt_step_up, volt_step_down): (u32, u32),
    cores_per_chip: u32,
    capability: TuningCapability,
) -> TuningBounds {
    TuningBounds {
        min_freq,
        max_freq,
        min_volt,
        max_volt,
        target_temp,
        vr_target_temp,
        critical_temp: target_temp + 10.0,
        vr_critical_temp: vr_target_temp + 15.0,
        freq_step_up,
        freq_step_down,
        volt_step_up,
        volt_step_down,
        cores_per_chip,
        chip_count: 1,
        capability,
    }
}

pub fn builtin_chip_profiles() -> Vec<ChipProfile> {
    vec![
        ChipProfile {
            name: "BM1370",
            matches: |m| m.contains("bm1370"),
            bounds: chip_bounds((400, 800), (1000, 1300), 60.0, 70.0, (25, 25), (10, 10), 2040, TuningCapability::Full),
        },
        ChipProfile {
            name: "BM1368",
            matches: |m| m.contains("bm1368"),
            bounds: chip_bounds((400, 650), (1100, 1300), 60.0, 70.0, (25, 25), (10, 10), 1276, TuningCapability::Full),
        },
        ChipProfile {
            name: "BM1366",
            matches: |m| m.contains("bm1366"),
            bounds: chip_bounds((400, 625), (1100, 1300), 60.0, 70.0, (25, 25), (10, 15), 894, TuningCapability::Full),
        },
        ChipProfile {
            name: "BM1397",
            matches: |m| m.contains("bm1397"),
            bounds: chip_bounds((400, 650), (1200, 1450), 58.0, 68.0, (25, 25), (10, 15), 672, TuningCapability::Limited),
        },
        // Antminer 哈希板芯片：原厂固件不开放调频
        ChipProfile {
            name: "BM136x-stock",
            matches: |m| m.contains("bm1362") || m.contains("bm1360"),
            bounds: chip_bounds((400, 600), (1200, 1400), 70.0, 80.0, (25, 25), (10, 10), 0, TuningCapability::Closed),
        },
    ]
}

pub fn builtin_device_overrides() -> Vec<DeviceOverride> {
    vec![
        DeviceOverride {
            name: "NerdQAxe++",
            matches: |d| d.contains("nerdqaxe++") || d.contains("nerdqaxe_plus_plus"),
            overrides: BoundsOverride {
                chip_count: Some(4),
                max_freq: Some(750),
                min_volt: Some(1100),
                max_volt: Some(1250),
                vr_target_temp: Some(75.0),
                vr_critical_temp: Some(90.0),
                ..Default::default()
            },
        },
        DeviceOverride {
            name: "NerdQAxe+",
            matches: |d| d.contains("nerdqaxe+") || d.contains("nerdqaxe_plus"),
            overrides: BoundsOverride {
                chip_count: Some(4),
                max_volt: Some(1250),
                vr_target_temp: Some(75.0),
                vr_critical_temp: Some(90.0),
                ..Default::default()
            },
        },
        DeviceOverride {
            name: "NerdOctAxe",
            matches: |d| d.contains("nerdoctaxe"),
            overrides: BoundsOverride {
                chip_count: Some(8),
                max_freq: Some(700),
                max_volt: Some(1250),
                vr_target_temp: Some(75.0),
                vr_critical_temp: Some(90.0),
                ..Default::default()
            },
        },
        DeviceOverride {
            name: "Bitaxe GT",
            matches: |d| d.contains("gt 800") || d.contains("gt800") || d.contains("gamma turbo"),
            overrides: BoundsOverride {
                chip_count: Some(2),
                vr_target_temp: Some(75.0),
                vr_critical_temp: Some(90.0),
                ..Default::default()
            },
        },
        DeviceOverride {
            name: "Bitaxe Hex",
            matches: |d| d.contains("hex"),
            overrides: BoundsOverride {
                chip_count: Some(6),
                max_volt: Some(1250),
                freq_step_up: Some(12),
                ..Default::default()
            },
        },
        DeviceOverride {
            name: "Antminer",
            matches: |d| d.contains("antminer"),
            overrides: BoundsOverride {
                capability: Some(TuningCapability::Closed),
                ..Default::default()
            },
        },
    ]
}
