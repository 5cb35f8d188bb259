//! 合成样本配置
//!
//! 所有参数扁平化；进程级实例可通过 `get_config` / `set_config` 读写。

use std::f64::consts::{FRAC_PI_3, PI};
use std::sync::RwLock;

use once_cell::sync::Lazy;

use crate::avatar::RootSampling;

/// 合成样本配置（扁平化，不嵌套）
#[derive(Debug, Clone, PartialEq)]
pub struct SynthConfig {
    // ========== 图像 ==========
    /// 输出图像宽度，默认 1280
    pub width: u32,
    /// 输出图像高度，默认 720
    pub height: u32,

    // ========== 形状 ==========
    /// 是否随机形状权重，默认 true
    pub randomize_shape: bool,

    // ========== 根位置（相机坐标，米）==========
    pub root_x_min: f64,
    pub root_x_max: f64,
    pub root_y_min: f64,
    pub root_y_max: f64,
    pub root_z_min: f64,
    pub root_z_max: f64,

    // ========== 根朝向 ==========
    /// 绕竖直轴的基准朝向，默认 π（面向相机）
    pub facing_angle: f64,
    /// 朝向抖动半径，默认 π/3
    pub azimuth_half_range: f64,
    /// 扰动旋转角度的标准差，默认 0.2
    pub perturb_sigma: f64,
}

impl Default for SynthConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,

            randomize_shape: true,

            root_x_min: -1.0,
            root_x_max: 1.0,
            root_y_min: -0.5,
            root_y_max: 0.5,
            // 人体距相机 2.2 ~ 4.5 米
            root_z_min: 2.2,
            root_z_max: 4.5,

            facing_angle: PI,
            azimuth_half_range: FRAC_PI_3,
            perturb_sigma: 0.2,
        }
    }
}

impl SynthConfig {
    /// 根采样参数
    pub fn root_sampling(&self) -> RootSampling {
        RootSampling {
            x_range: (self.root_x_min, self.root_x_max),
            y_range: (self.root_y_min, self.root_y_max),
            z_range: (self.root_z_min, self.root_z_max),
            facing_angle: self.facing_angle,
            azimuth_half_range: self.azimuth_half_range,
            perturb_sigma: self.perturb_sigma,
        }
    }
}

static SYNTH_CONFIG: Lazy<RwLock<SynthConfig>> = Lazy::new(|| RwLock::new(SynthConfig::default()));

pub fn get_config() -> SynthConfig {
    SYNTH_CONFIG
        .read()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .clone()
}

pub fn set_config(config: SynthConfig) {
    *SYNTH_CONFIG
        .write()
        .unwrap_or_else(|poisoned| poisoned.into_inner()) = config;
}

pub fn reset_config() {
    set_config(SynthConfig::default());
}
