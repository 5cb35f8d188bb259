//! 随机形状、姿态与根变换

use std::f64::consts::{FRAC_PI_2, FRAC_PI_3, PI, TAU};

use glam::{DQuat, DVec3};
use rand::Rng;
use rand_distr::StandardNormal;

use super::{axis_angle_to_quat, Avatar};
use crate::{AvatarError, Result};

/// 根位置与朝向的采样范围
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RootSampling {
    /// 各轴位置的均匀分布区间（相机坐标，单位米）
    pub x_range: (f64, f64),
    pub y_range: (f64, f64),
    pub z_range: (f64, f64),
    /// 绕竖直轴的基准朝向（π 为面向相机）
    pub facing_angle: f64,
    /// 朝向在基准附近的均匀抖动半径
    pub azimuth_half_range: f64,
    /// 扰动旋转角度的标准差
    pub perturb_sigma: f64,
}

impl Default for RootSampling {
    fn default() -> Self {
        Self {
            x_range: (-1.0, 1.0),
            y_range: (-0.5, 0.5),
            z_range: (2.2, 4.5),
            facing_angle: PI,
            azimuth_half_range: FRAC_PI_3,
            perturb_sigma: 0.2,
        }
    }
}

/// 区间为空或退化（如方位半宽为 0）时直接取下界
#[inline]
fn uniform<R: Rng + ?Sized>(rng: &mut R, (lo, hi): (f64, f64)) -> f64 {
    if lo < hi {
        rng.gen_range(lo..hi)
    } else {
        lo
    }
}

impl<'a> Avatar<'a> {
    /// 每个形状权重取标准正态分布
    pub fn randomize_shape<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        for w in self.shape_weights.iter_mut() {
            *w = rng.sample(StandardNormal);
        }
        self.touch();
    }

    /// 从姿态先验采样所有非根关节的局部旋转
    pub fn randomize_pose<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Result<()> {
        let prior = self
            .model
            .pose_prior()
            .ok_or(AvatarError::MissingCapability("pose prior"))?;
        let sample = prior.sample(rng);
        for i in 1..self.local_rotations.len() {
            let k = 3 * (i - 1);
            let v = DVec3::new(sample[k], sample[k + 1], sample[k + 2]);
            self.local_rotations[i] = axis_angle_to_quat(v);
        }
        self.touch();
        Ok(())
    }

    /// 在给定范围内随机根位置，并生成面向相机附近的根旋转
    pub fn randomize_root<R: Rng + ?Sized>(&mut self, rng: &mut R, sampling: &RootSampling) {
        self.root_position = DVec3::new(
            uniform(rng, sampling.x_range),
            uniform(rng, sampling.y_range),
            uniform(rng, sampling.z_range),
        );

        let half = sampling.azimuth_half_range;
        let angle_up = uniform(rng, (-half, half)) + sampling.facing_angle;
        let up = DQuat::from_rotation_y(angle_up);

        // 球面坐标均匀取扰动轴，扰动角度服从正态分布
        let theta = uniform(rng, (0.0, TAU));
        let phi = uniform(rng, (-FRAC_PI_2, FRAC_PI_2));
        let axis = DVec3::new(phi.sin() * theta.cos(), phi.cos(), phi.sin() * theta.sin());
        let angle = rng.sample::<f64, _>(StandardNormal) * sampling.perturb_sigma;
        let perturb = axis_angle_to_quat(axis.normalize_or_zero() * angle);

        self.local_rotations[0] = (perturb * up).normalize();
        self.touch();
    }
}
