//! 人体模型（静态、只读、可在线程间共享）

mod loader;
mod pcd;
pub(crate) mod tokens;

pub use loader::load_model;
pub use pcd::load_pcd_points;

use std::path::{Path, PathBuf};

use glam::DVec3;
use nalgebra::{DMatrix, DVector};

use crate::prior::GaussianMixture;
use crate::{AvatarError, Result};

/// 点受某关节影响的权重
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct JointWeight {
    pub weight: f64,
    pub joint: usize,
}

/// 关节影响某点的权重（关节主序稀疏矩阵的一行）
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PointWeight {
    pub weight: f64,
    pub point: usize,
}

/// 稀疏关节回归器（点数 × 关节数），按关节列存储
#[derive(Clone, Debug, Default)]
pub struct JointRegressor {
    columns: Vec<Vec<PointWeight>>,
}

impl JointRegressor {
    pub fn new(columns: Vec<Vec<PointWeight>>) -> Self {
        Self { columns }
    }

    pub fn joint_count(&self) -> usize {
        self.columns.len()
    }

    pub fn column(&self, joint: usize) -> &[PointWeight] {
        &self.columns[joint]
    }

    /// 由点云（扁平 x,y,z 布局）回归关节绝对位置
    pub fn regress(&self, cloud: &DVector<f64>) -> Vec<DVec3> {
        self.columns
            .iter()
            .map(|col| {
                col.iter()
                    .fold(DVec3::ZERO, |acc, e| acc + point_at(cloud, e.point) * e.weight)
            })
            .collect()
    }
}

/// 关节定位方式，加载时根据文件是否存在选择其一
#[derive(Clone, Debug)]
pub enum JointLocalization {
    /// 由变形后的点云稀疏回归关节位置
    SparseRegressor(JointRegressor),
    /// 由形状权重直接线性映射关节位置：base + matrix·w
    ShapeRegressor {
        base: DVector<f64>,
        matrix: DMatrix<f64>,
    },
    /// 不可用：关节固定在静止位置，形状改变后不再准确
    Unavailable,
}

impl JointLocalization {
    pub fn is_available(&self) -> bool {
        !matches!(self, JointLocalization::Unavailable)
    }
}

/// 模型能力标志（可选资源缺失时对应功能不可用）
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ModelCapabilities {
    pub joint_localization: bool,
    pub mesh: bool,
    pub pose_prior: bool,
    pub shape_keys: bool,
}

impl ModelCapabilities {
    /// 是否可以光栅化（需要网格）
    pub fn can_render(&self) -> bool {
        self.mesh
    }

    /// 是否可以从先验采样姿态
    pub fn can_sample_pose(&self) -> bool {
        self.pose_prior
    }
}

/// 构建 `BodyModel` 所需的原始数据
#[derive(Clone, Debug)]
pub struct ModelData {
    /// 父关节索引，根关节为 -1
    pub parents: Vec<i32>,
    pub joint_names: Vec<String>,
    pub initial_joint_pos: Vec<DVec3>,
    /// 基础点云，扁平存储 x1 y1 z1 x2 y2 z2 ...
    pub base_points: DVector<f64>,
    /// 形状键基 (3·点数 × 形状键数)
    pub shape_keys: DMatrix<f64>,
    /// 每个点的关节权重列表
    pub point_weights: Vec<Vec<JointWeight>>,
    pub localization: JointLocalization,
    pub mesh: Option<Vec<[usize; 3]>>,
    pub pose_prior: Option<GaussianMixture>,
}

/// 人体模型
#[derive(Clone, Debug)]
pub struct BodyModel {
    source: Option<PathBuf>,
    parents: Vec<i32>,
    joint_names: Vec<String>,
    initial_joint_pos: Vec<DVec3>,
    base_points: DVector<f64>,
    shape_keys: DMatrix<f64>,
    localization: JointLocalization,

    /// 每点的关节分配，按权重降序
    assigned_joints: Vec<Vec<JointWeight>>,
    /// 关节主序的稀疏权重行 (Σ分配数 × 点数)，每行恰有一个非零元
    assign_rows: Vec<PointWeight>,
    /// 每个关节在 `assign_rows` 中的起始行，长度为关节数 + 1
    assign_starts: Vec<usize>,

    mesh: Vec<[usize; 3]>,
    has_mesh: bool,
    pose_prior: Option<GaussianMixture>,
}

impl BodyModel {
    /// 从模型目录加载（多关节蒙皮）
    pub fn load<P: AsRef<Path>>(model_dir: P) -> Result<Self> {
        load_model(model_dir, false)
    }

    /// 校验数据并生成蒙皮分配表
    ///
    /// `limit_one_joint_per_point` 为真时每点只保留权重最大的关节（刚性蒙皮）。
    pub fn from_data(data: ModelData, limit_one_joint_per_point: bool) -> Result<Self> {
        let ModelData {
            mut parents,
            mut joint_names,
            initial_joint_pos,
            base_points,
            shape_keys,
            point_weights,
            localization,
            mesh,
            pose_prior,
        } = data;

        let n_joints = parents.len();
        if n_joints == 0 {
            return Err(AvatarError::InvalidState("model has no joints".to_string()));
        }
        check_len("rest joint positions", n_joints, initial_joint_pos.len())?;
        if joint_names.is_empty() {
            joint_names = (0..n_joints).map(|i| format!("joint{}", i)).collect();
        }
        check_len("joint names", n_joints, joint_names.len())?;

        parents[0] = -1;
        for (j, &p) in parents.iter().enumerate().skip(1) {
            if p < 0 || p as usize >= j {
                return Err(AvatarError::InvalidState(format!(
                    "joint {} has parent {}, joints must be topologically sorted",
                    j, p
                )));
            }
        }

        if base_points.len() % 3 != 0 {
            return Err(AvatarError::InvalidState(
                "base point vector length is not a multiple of 3".to_string(),
            ));
        }
        let n_points = base_points.len() / 3;
        check_len("shape key rows", 3 * n_points, shape_keys.nrows())?;
        check_len("point weight lists", n_points, point_weights.len())?;

        let n_keys = shape_keys.ncols();
        match &localization {
            JointLocalization::SparseRegressor(reg) => {
                check_len("joint regressor columns", n_joints, reg.joint_count())?;
                for col in &reg.columns {
                    if let Some(e) = col.iter().find(|e| e.point >= n_points) {
                        return Err(AvatarError::InvalidState(format!(
                            "joint regressor references point {} of {}",
                            e.point, n_points
                        )));
                    }
                }
            }
            JointLocalization::ShapeRegressor { base, matrix } => {
                check_len("joint shape regressor base", 3 * n_joints, base.len())?;
                check_len("joint shape regressor rows", 3 * n_joints, matrix.nrows())?;
                check_len("joint shape regressor columns", n_keys, matrix.ncols())?;
            }
            JointLocalization::Unavailable => {}
        }

        // 每点按权重降序排列并归一化，使权重之和为 1
        let mut assigned_joints = Vec::with_capacity(n_points);
        for (p, mut list) in point_weights.into_iter().enumerate() {
            if list.is_empty() {
                return Err(AvatarError::InvalidState(format!(
                    "point {} has no joint assignment",
                    p
                )));
            }
            if let Some(e) = list
                .iter()
                .find(|e| e.joint >= n_joints || !(e.weight >= 0.0) || !e.weight.is_finite())
            {
                return Err(AvatarError::InvalidState(format!(
                    "point {} has invalid assignment (joint {}, weight {})",
                    p, e.joint, e.weight
                )));
            }
            list.sort_by(|a, b| b.weight.total_cmp(&a.weight));

            if limit_one_joint_per_point {
                list.truncate(1);
                list[0].weight = 1.0;
            } else {
                let total: f64 = list.iter().map(|e| e.weight).sum();
                if total <= 0.0 {
                    return Err(AvatarError::InvalidState(format!(
                        "point {} has zero total skinning weight",
                        p
                    )));
                }
                for e in &mut list {
                    e.weight /= total;
                }
            }
            assigned_joints.push(list);
        }

        // 关节主序稀疏布局
        let mut per_joint: Vec<Vec<PointWeight>> = vec![Vec::new(); n_joints];
        for (p, list) in assigned_joints.iter().enumerate() {
            for e in list {
                per_joint[e.joint].push(PointWeight {
                    weight: e.weight,
                    point: p,
                });
            }
        }
        let mut assign_starts = Vec::with_capacity(n_joints + 1);
        let mut assign_rows = Vec::with_capacity(per_joint.iter().map(Vec::len).sum());
        for rows in per_joint {
            assign_starts.push(assign_rows.len());
            assign_rows.extend(rows);
        }
        assign_starts.push(assign_rows.len());

        let has_mesh = mesh.is_some();
        let mesh = mesh.unwrap_or_default();
        if let Some((f, face)) = mesh
            .iter()
            .enumerate()
            .find(|(_, face)| face.iter().any(|&v| v >= n_points))
        {
            return Err(AvatarError::InvalidState(format!(
                "face {} {:?} references a point beyond {}",
                f, face, n_points
            )));
        }

        if let Some(prior) = &pose_prior {
            check_len("pose prior dimension", 3 * (n_joints - 1), prior.dims())?;
        }

        Ok(Self {
            source: None,
            parents,
            joint_names,
            initial_joint_pos,
            base_points,
            shape_keys,
            localization,
            assigned_joints,
            assign_rows,
            assign_starts,
            mesh,
            has_mesh,
            pose_prior,
        })
    }

    pub(crate) fn with_source(mut self, dir: PathBuf) -> Self {
        self.source = Some(dir);
        self
    }

    /// 模型目录（程序构建的模型为 `None`）
    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    pub fn joint_count(&self) -> usize {
        self.parents.len()
    }

    pub fn point_count(&self) -> usize {
        self.base_points.len() / 3
    }

    pub fn shape_key_count(&self) -> usize {
        self.shape_keys.ncols()
    }

    pub fn face_count(&self) -> usize {
        self.mesh.len()
    }

    /// 父关节索引，根关节为 -1
    pub fn parents(&self) -> &[i32] {
        &self.parents
    }

    /// 父关节；根关节返回 `None`
    pub fn parent(&self, joint: usize) -> Option<usize> {
        let p = self.parents[joint];
        (p >= 0).then_some(p as usize)
    }

    pub fn joint_names(&self) -> &[String] {
        &self.joint_names
    }

    /// 静止姿态下的关节位置
    pub fn initial_joint_positions(&self) -> &[DVec3] {
        &self.initial_joint_pos
    }

    pub fn base_points(&self) -> &DVector<f64> {
        &self.base_points
    }

    pub fn shape_keys(&self) -> &DMatrix<f64> {
        &self.shape_keys
    }

    pub fn localization(&self) -> &JointLocalization {
        &self.localization
    }

    /// 某点的关节分配（权重降序）
    pub fn assigned_joints(&self, point: usize) -> &[JointWeight] {
        &self.assigned_joints[point]
    }

    /// 某点权重最大的关节
    pub fn dominant_joint(&self, point: usize) -> usize {
        self.assigned_joints[point][0].joint
    }

    /// 某关节影响的点（关节主序稀疏矩阵中的连续行）
    pub fn assigned_points(&self, joint: usize) -> &[PointWeight] {
        &self.assign_rows[self.assign_starts[joint]..self.assign_starts[joint + 1]]
    }

    /// 所有稀疏权重行
    pub fn assignment_rows(&self) -> &[PointWeight] {
        &self.assign_rows
    }

    pub fn assignment_starts(&self) -> &[usize] {
        &self.assign_starts
    }

    /// 三角形网格；未加载网格时为空
    pub fn mesh(&self) -> &[[usize; 3]] {
        &self.mesh
    }

    pub fn pose_prior(&self) -> Option<&GaussianMixture> {
        self.pose_prior.as_ref()
    }

    pub fn capabilities(&self) -> ModelCapabilities {
        ModelCapabilities {
            joint_localization: self.localization.is_available(),
            mesh: self.has_mesh,
            pose_prior: self.pose_prior.is_some(),
            shape_keys: self.shape_key_count() > 0,
        }
    }
}

/// 读取扁平点向量中的第 `index` 个点
#[inline]
pub(crate) fn point_at(cloud: &DVector<f64>, index: usize) -> DVec3 {
    DVec3::new(cloud[3 * index], cloud[3 * index + 1], cloud[3 * index + 2])
}

fn check_len(what: &'static str, expected: usize, actual: usize) -> Result<()> {
    if expected != actual {
        return Err(AvatarError::DimensionMismatch {
            what,
            expected,
            actual,
        });
    }
    Ok(())
}
