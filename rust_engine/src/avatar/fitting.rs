//! 由观测关节位置近似拟合姿态
//!
//! 不做优化求解：逐根骨骼取静止骨向量到观测骨向量的最短弧旋转，
//! 再去掉父骨骼的旋转得到局部旋转。

use glam::{DQuat, DVec3};

use super::Avatar;
use crate::skeleton::SmplJoint;
use crate::{AvatarError, Result};

/// 形状键 0 增加该值时模型约加宽 1 米
const SCALE_TO_SHAPE_WEIGHT: f64 = 32.0;
/// 无法估计缩放时使用的形状权重
const FALLBACK_SHAPE_WEIGHT: f64 = 1.5;

#[inline]
fn is_valid(v: DVec3) -> bool {
    v.is_finite()
}

/// 两向量之间的最短弧旋转；任一向量无效或长度为零时返回单位旋转
fn rotation_between(from: DVec3, to: DVec3) -> DQuat {
    let (Some(a), Some(b)) = (from.try_normalize(), to.try_normalize()) else {
        return DQuat::IDENTITY;
    };
    DQuat::from_rotation_arc(a, b)
}

impl<'a> Avatar<'a> {
    /// 使实例对齐到观测关节位置
    ///
    /// `observed` 与模型关节一一对应；未观测的关节用 NaN 标记。
    /// 设置根位置、根旋转、形状键 0（整体缩放）与各关节局部旋转，调用方随后需 `update()`。
    pub fn fit_to_observed_joints(&mut self, observed: &[DVec3]) -> Result<()> {
        let model = self.model;
        let n_joints = model.joint_count();
        if observed.len() != n_joints {
            return Err(AvatarError::DimensionMismatch {
                what: "observed joints",
                expected: n_joints,
                actual: observed.len(),
            });
        }
        let pelvis = SmplJoint::RootPelvis.index();
        let spine1 = SmplJoint::Spine1.index();
        let spine2 = SmplJoint::Spine2.index();
        if n_joints <= spine2 {
            return Err(AvatarError::InvalidState(format!(
                "joint fitting needs an SMPL-style skeleton, model has {} joints",
                n_joints
            )));
        }
        let rest = model.initial_joint_positions();

        if is_valid(observed[pelvis]) {
            self.root_position = observed[pelvis];
        }

        // 根旋转：静止 骨盆→脊柱1 向量对齐到观测向量
        let root_rot = if is_valid(observed[pelvis]) && is_valid(observed[spine1]) {
            rotation_between(rest[spine1] - rest[pelvis], observed[spine1] - observed[pelvis])
        } else {
            DQuat::IDENTITY
        };

        // 平均骨长比例 → 形状键 0
        // 只平均两端都有观测的骨骼；缺失关节不会让整个比例变成 NaN，
        // 只有一根有效骨骼都没有时才退回默认权重
        let (ratio_sum, ratio_count) = (1..n_joints)
            .filter_map(|i| {
                let p = model.parents()[i] as usize;
                if !is_valid(observed[i]) || !is_valid(observed[p]) {
                    return None;
                }
                let rest_len = (rest[i] - rest[p]).length();
                (rest_len > f64::EPSILON)
                    .then(|| (observed[i] - observed[p]).length() / rest_len)
            })
            .fold((0.0, 0usize), |(s, c), r| (s + r, c + 1));

        if model.shape_key_count() > 0 {
            let scale_avg = ratio_sum / ratio_count as f64;
            let base_scale = (rest[spine2] - rest[pelvis]).length() * (scale_avg - 1.0);
            let mut w0 = base_scale * SCALE_TO_SHAPE_WEIGHT;
            if !w0.is_finite() {
                log::warn!("关节拟合无法估计缩放，形状权重退回 {}", FALLBACK_SHAPE_WEIGHT);
                w0 = FALLBACK_SHAPE_WEIGHT;
            }
            self.shape_weights[0] = w0;
        }

        // 逐骨骼对齐，父关节在前
        let mut bone_rot = vec![DQuat::IDENTITY; n_joints];
        bone_rot[0] = root_rot;
        self.local_rotations[0] = root_rot;
        for i in 1..n_joints {
            let p = model.parents()[i] as usize;
            if is_valid(observed[i]) && is_valid(observed[p]) {
                bone_rot[i] = rotation_between(rest[i] - rest[p], observed[i] - observed[p]);
                self.local_rotations[i] = (bone_rot[p].conjugate() * bone_rot[i]).normalize();
            } else {
                bone_rot[i] = bone_rot[p];
                self.local_rotations[i] = DQuat::IDENTITY;
            }
        }

        self.touch();
        Ok(())
    }
}
