//! 人体实例：形状/姿态状态与蒙皮更新
//!
//! `Avatar` 借用一个只读的 `BodyModel`，保存形状权重、根位置与各关节局部旋转，
//! `update()` 依次执行形状混合、关节定位、前向运动学与线性混合蒙皮。
//!
//! 每次修改形状或姿态都会刷新版本号；渲染器以版本号判断缓存是否仍然有效。

mod fitting;
mod sampling;

pub use sampling::RootSampling;

use std::sync::atomic::{AtomicU64, Ordering};

use glam::{DMat3, DQuat, DVec3};
use nalgebra::DVector;

use crate::model::{point_at, BodyModel, JointLocalization};
use crate::{AvatarError, Result};

/// 全局版本计数器，保证不同实例的版本号也互不相同
static NEXT_VERSION: AtomicU64 = AtomicU64::new(1);

fn next_version() -> u64 {
    NEXT_VERSION.fetch_add(1, Ordering::Relaxed)
}

/// 绑定到人体模型的可变实例
#[derive(Clone, Debug)]
pub struct Avatar<'a> {
    model: &'a BodyModel,

    shape_weights: DVector<f64>,
    root_position: DVec3,
    /// 各关节局部旋转；根关节的局部旋转即其世界旋转
    local_rotations: Vec<DQuat>,

    // update() 的输出
    joint_world_pos: Vec<DVec3>,
    joint_world_rot: Vec<DQuat>,
    cloud: Vec<DVec3>,

    /// 最近一次修改的版本号
    version: u64,
    /// 最近一次 update() 时的版本号
    posed_version: Option<u64>,
}

impl<'a> Avatar<'a> {
    /// 创建零形状权重、单位旋转、根位于原点的实例（尚未更新）
    pub fn new(model: &'a BodyModel) -> Self {
        Self {
            model,
            shape_weights: DVector::zeros(model.shape_key_count()),
            root_position: DVec3::ZERO,
            local_rotations: vec![DQuat::IDENTITY; model.joint_count()],
            joint_world_pos: Vec::new(),
            joint_world_rot: Vec::new(),
            cloud: Vec::new(),
            version: next_version(),
            posed_version: None,
        }
    }

    pub fn model(&self) -> &'a BodyModel {
        self.model
    }

    fn touch(&mut self) {
        self.version = next_version();
    }

    // ========== 形状 / 姿态 ==========

    pub fn shape_weights(&self) -> &DVector<f64> {
        &self.shape_weights
    }

    pub fn set_shape_weights(&mut self, weights: DVector<f64>) -> Result<()> {
        if weights.len() != self.model.shape_key_count() {
            return Err(AvatarError::DimensionMismatch {
                what: "shape weights",
                expected: self.model.shape_key_count(),
                actual: weights.len(),
            });
        }
        self.shape_weights = weights;
        self.touch();
        Ok(())
    }

    /// 设置单个形状权重；越界时报错
    pub fn set_shape_weight(&mut self, key: usize, weight: f64) -> Result<()> {
        let count = self.shape_weights.len();
        let slot = self
            .shape_weights
            .get_mut(key)
            .ok_or(AvatarError::DimensionMismatch {
                what: "shape key index",
                expected: count,
                actual: key,
            })?;
        *slot = weight;
        self.touch();
        Ok(())
    }

    pub fn root_position(&self) -> DVec3 {
        self.root_position
    }

    pub fn set_root_position(&mut self, position: DVec3) {
        self.root_position = position;
        self.touch();
    }

    pub fn local_rotations(&self) -> &[DQuat] {
        &self.local_rotations
    }

    pub fn local_rotation(&self, joint: usize) -> DQuat {
        self.local_rotations[joint]
    }

    /// 设置单个关节的局部旋转（关节 0 为根旋转）
    pub fn set_local_rotation(&mut self, joint: usize, rotation: DQuat) -> Result<()> {
        let count = self.local_rotations.len();
        let slot = self
            .local_rotations
            .get_mut(joint)
            .ok_or(AvatarError::DimensionMismatch {
                what: "joint index",
                expected: count,
                actual: joint,
            })?;
        *slot = rotation.normalize();
        self.touch();
        Ok(())
    }

    pub fn set_local_rotations(&mut self, rotations: Vec<DQuat>) -> Result<()> {
        if rotations.len() != self.model.joint_count() {
            return Err(AvatarError::DimensionMismatch {
                what: "joint rotations",
                expected: self.model.joint_count(),
                actual: rotations.len(),
            });
        }
        self.local_rotations = rotations.into_iter().map(DQuat::normalize).collect();
        self.touch();
        Ok(())
    }

    pub fn root_rotation(&self) -> DQuat {
        self.local_rotations[0]
    }

    pub fn set_root_rotation(&mut self, rotation: DQuat) {
        self.local_rotations[0] = rotation.normalize();
        self.touch();
    }

    /// 恢复为新建时的状态（保留已计算的输出，但标记为过期）
    pub fn reset(&mut self) {
        self.shape_weights.fill(0.0);
        self.root_position = DVec3::ZERO;
        self.local_rotations.fill(DQuat::IDENTITY);
        self.touch();
    }

    // ========== 版本 ==========

    /// 当前修改版本号（全局唯一）
    pub fn version(&self) -> u64 {
        self.version
    }

    /// 是否至少调用过一次 update()
    pub fn is_posed(&self) -> bool {
        self.posed_version.is_some() && !self.cloud.is_empty()
    }

    /// 上次 update() 之后是否又被修改
    pub fn is_stale(&self) -> bool {
        self.posed_version != Some(self.version)
    }

    // ========== 输出 ==========

    /// 变形后的点云（未更新时为空）
    pub fn cloud(&self) -> &[DVec3] {
        &self.cloud
    }

    /// 以扁平 x,y,z 布局返回变形后的点云
    pub fn cloud_flat(&self) -> DVector<f64> {
        DVector::from_iterator(
            self.cloud.len() * 3,
            self.cloud.iter().flat_map(|p| [p.x, p.y, p.z]),
        )
    }

    pub fn joint_world_positions(&self) -> &[DVec3] {
        &self.joint_world_pos
    }

    pub fn joint_world_rotations(&self) -> &[DQuat] {
        &self.joint_world_rot
    }

    /// 执行形状混合、关节定位、前向运动学与蒙皮
    ///
    /// 所有中间结果先写入局部缓冲，最后一次性替换输出字段。
    pub fn update(&mut self) {
        let model = self.model;
        let n_joints = model.joint_count();
        let n_points = model.point_count();

        // 1. 形状混合
        let shaped = if model.shape_key_count() > 0 {
            model.base_points() + model.shape_keys() * &self.shape_weights
        } else {
            model.base_points().clone()
        };

        // 2. 关节定位（绝对位置）
        let mut joints: Vec<DVec3> = match model.localization() {
            JointLocalization::ShapeRegressor { base, matrix } => {
                let flat = if matrix.ncols() > 0 {
                    base + matrix * &self.shape_weights
                } else {
                    base.clone()
                };
                (0..n_joints).map(|j| point_at(&flat, j)).collect()
            }
            JointLocalization::SparseRegressor(reg) => reg.regress(&shaped),
            JointLocalization::Unavailable => model.initial_joint_positions().to_vec(),
        };

        // 3. 每个关节块内各点相对关节的偏移
        let rows = model.assignment_rows();
        let starts = model.assignment_starts();
        let mut deltas = Vec::with_capacity(rows.len());
        for j in 0..n_joints {
            for row in model.assigned_points(j) {
                deltas.push(point_at(&shaped, row.point) - joints[j]);
            }
        }

        // 关节位置改为相对父关节的偏移，根关节保持绝对
        for j in (1..n_joints).rev() {
            let p = model.parents()[j] as usize;
            let parent = joints[p];
            joints[j] -= parent;
        }

        // 4. 前向运动学（父关节索引总小于子关节）
        let mut world_rot = vec![DQuat::IDENTITY; n_joints];
        let mut world_pos = vec![DVec3::ZERO; n_joints];
        world_rot[0] = self.local_rotations[0];
        world_pos[0] = self.root_position;
        for i in 1..n_joints {
            let p = model.parents()[i] as usize;
            world_rot[i] = (world_rot[p] * self.local_rotations[i]).normalize();
            world_pos[i] = world_rot[p] * joints[i] + world_pos[p];
        }

        // 5/6. 变换每个关节块并按权重混合
        let mut cloud = vec![DVec3::ZERO; n_points];
        for j in 0..n_joints {
            let rot = DMat3::from_quat(world_rot[j]);
            let block = starts[j]..starts[j + 1];
            for (row, delta) in rows[block.clone()].iter().zip(&deltas[block]) {
                cloud[row.point] += (rot * *delta + world_pos[j]) * row.weight;
            }
        }

        self.joint_world_rot = world_rot;
        self.joint_world_pos = world_pos;
        self.cloud = cloud;
        self.posed_version = Some(self.version);
    }

    // ========== 姿态参数 ==========

    /// 所有非根关节局部旋转的轴角向量，按关节顺序拼接（3·(关节数-1) 维）
    pub fn pose_params(&self) -> DVector<f64> {
        let n = self.local_rotations.len().saturating_sub(1);
        DVector::from_iterator(
            3 * n,
            self.local_rotations
                .iter()
                .skip(1)
                .flat_map(|q| quat_to_axis_angle(*q).to_array()),
        )
    }

    /// 当前姿态在先验下的概率密度
    pub fn pdf(&self) -> Result<f64> {
        let prior = self
            .model
            .pose_prior()
            .ok_or(AvatarError::MissingCapability("pose prior"))?;
        Ok(prior.pdf(&self.pose_params()))
    }

    /// 先验残差的平方范数（相差常数的负对数似然）
    pub fn neg_log_likelihood(&self) -> Result<f64> {
        let prior = self
            .model
            .pose_prior()
            .ok_or(AvatarError::MissingCapability("pose prior"))?;
        Ok(prior.residual(&self.pose_params()).norm_squared())
    }
}

/// 轴角向量 → 四元数；零角度返回单位旋转
pub(crate) fn axis_angle_to_quat(v: DVec3) -> DQuat {
    let angle = v.length();
    if !(angle > 1e-12) || !angle.is_finite() {
        return DQuat::IDENTITY;
    }
    DQuat::from_axis_angle(v / angle, angle)
}

/// 四元数 → 轴角向量（角度取 [0, π]）
pub(crate) fn quat_to_axis_angle(q: DQuat) -> DVec3 {
    let q = if q.w < 0.0 { -q } else { q };
    let (axis, angle) = q.normalize().to_axis_angle();
    if !(angle > 1e-12) || !axis.is_finite() {
        return DVec3::ZERO;
    }
    axis * angle
}
