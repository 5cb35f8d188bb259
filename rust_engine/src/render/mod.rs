//! 人体实例的软件渲染器
//!
//! 渲染器持有相机内参和一份投影缓存（点、关节的像素坐标以及按深度排序的面）。
//! 缓存以实例的版本号为键：实例被修改并重新 `update()` 后自动重建。
//! 绘制使用画家算法，由远到近覆盖，不使用深度缓冲。

mod raster;

use glam::{DVec2, DVec3};
use image::{GrayImage, ImageBuffer, Luma};

use crate::avatar::Avatar;
use crate::camera::CameraIntrinsics;
use crate::{AvatarError, Result};

use raster::{paint_barycentric, paint_constant, paint_nearest};

/// 深度图（背景为 0）
pub type DepthImage = ImageBuffer<Luma<f32>, Vec<f32>>;
/// 面索引图（背景为 -1）
pub type FaceIndexImage = ImageBuffer<Luma<i32>, Vec<i32>>;

/// 部位标签图的背景值
pub const PART_BACKGROUND: u8 = 255;
/// 面索引图的背景值
pub const FACE_BACKGROUND: i32 = -1;

/// 法线视线分量低于该值的面视为侧对相机
const EDGE_ON_THRESHOLD: f64 = 0.1;
/// 光照渲染中法线视线分量低于该值的面不可见
const LAMBERT_VISIBLE_THRESHOLD: f64 = 1e-2;
/// 插值结果的上限
const MAX_INTERPOLATED: f64 = 255.0;

const MAIN_LIGHT: DVec3 = DVec3::new(0.8, 1.5, -1.2);
const MAIN_LIGHT_INTENSITY: f64 = 0.8;
const BACK_LIGHT: DVec3 = DVec3::new(-0.2, -1.5, 0.4);
const BACK_LIGHT_INTENSITY: f64 = 0.2;

/// 关节 → 粗粒度部位编号的映射表
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartMap {
    parts: Vec<u8>,
}

impl PartMap {
    /// 部位编号必须小于 255（255 为背景）
    pub fn new(parts: Vec<u8>) -> Result<Self> {
        if let Some(joint) = parts.iter().position(|&p| p == PART_BACKGROUND) {
            return Err(AvatarError::InvalidState(format!(
                "joint {} maps to reserved part id {}",
                joint, PART_BACKGROUND
            )));
        }
        Ok(Self { parts })
    }

    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    pub fn part(&self, joint: usize) -> u8 {
        self.parts[joint]
    }

    /// 部位数量（最大编号 + 1）
    pub fn num_parts(&self) -> usize {
        self.parts.iter().map(|&p| p as usize + 1).max().unwrap_or(0)
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.parts
    }
}

/// 投影缓存
#[derive(Clone, Debug)]
struct Projection {
    version: u64,
    points: Vec<DVec2>,
    joints: Vec<DVec2>,
    /// 面索引，按平均深度由远到近
    faces: Vec<usize>,
}

/// 人体渲染器
#[derive(Clone, Debug)]
pub struct AvatarRenderer {
    intrinsics: CameraIntrinsics,
    cache: Option<Projection>,
}

impl AvatarRenderer {
    pub fn new(intrinsics: CameraIntrinsics) -> Self {
        Self {
            intrinsics,
            cache: None,
        }
    }

    pub fn intrinsics(&self) -> &CameraIntrinsics {
        &self.intrinsics
    }

    pub fn set_intrinsics(&mut self, intrinsics: CameraIntrinsics) {
        self.intrinsics = intrinsics;
        self.invalidate();
    }

    /// 清空投影缓存
    pub fn invalidate(&mut self) {
        self.cache = None;
    }

    /// 确认实例已更新且未过期，必要时重建缓存
    fn prepare(&mut self, avatar: &Avatar<'_>) -> Result<&Projection> {
        if !avatar.is_posed() {
            log::warn!("尝试渲染尚未 update() 的人体实例");
            return Err(AvatarError::InvalidState(
                "avatar has not been updated".to_string(),
            ));
        }
        if avatar.is_stale() {
            return Err(AvatarError::InvalidState(
                "avatar was modified after its last update".to_string(),
            ));
        }

        let fresh = matches!(&self.cache, Some(c) if c.version == avatar.version());
        if !fresh {
            self.cache = Some(self.project(avatar));
        }
        self.cache
            .as_ref()
            .ok_or_else(|| AvatarError::InvalidState("projection cache unavailable".to_string()))
    }

    fn project(&self, avatar: &Avatar<'_>) -> Projection {
        let cloud = avatar.cloud();
        let points = cloud.iter().map(|p| self.intrinsics.project(*p)).collect();
        let joints = avatar
            .joint_world_positions()
            .iter()
            .map(|p| self.intrinsics.project(*p))
            .collect();

        let mesh = avatar.model().mesh();
        let mut depths: Vec<(f64, usize)> = mesh
            .iter()
            .enumerate()
            .map(|(i, f)| ((cloud[f[0]].z + cloud[f[1]].z + cloud[f[2]].z) / 3.0, i))
            .collect();
        depths.sort_by(|a, b| b.0.total_cmp(&a.0));

        Projection {
            version: avatar.version(),
            points,
            joints,
            faces: depths.into_iter().map(|(_, i)| i).collect(),
        }
    }

    /// 变形点云的像素坐标
    pub fn projected_points(&mut self, avatar: &Avatar<'_>) -> Result<&[DVec2]> {
        Ok(&self.prepare(avatar)?.points)
    }

    /// 关节的像素坐标
    pub fn projected_joints(&mut self, avatar: &Avatar<'_>) -> Result<&[DVec2]> {
        Ok(&self.prepare(avatar)?.joints)
    }

    /// 由远到近排序的面索引
    pub fn ordered_faces(&mut self, avatar: &Avatar<'_>) -> Result<&[usize]> {
        Ok(&self.prepare(avatar)?.faces)
    }

    /// 渲染需要网格
    fn require_mesh(avatar: &Avatar<'_>) -> Result<()> {
        if !avatar.model().capabilities().can_render() {
            return Err(AvatarError::MissingCapability("mesh"));
        }
        Ok(())
    }

    /// 深度图：侧对相机的面填 0，其余按顶点深度重心插值
    pub fn render_depth(&mut self, avatar: &Avatar<'_>, width: u32, height: u32) -> Result<DepthImage> {
        Self::require_mesh(avatar)?;
        let proj = self.prepare(avatar)?;
        let cloud = avatar.cloud();
        let mesh = avatar.model().mesh();

        let mut image = DepthImage::new(width, height);
        for &f in &proj.faces {
            let face = mesh[f];
            let pts = face.map(|v| proj.points[v]);
            let [a, b, c] = face.map(|v| cloud[v]);
            if face_normal(a, b, c).z.abs() < EDGE_ON_THRESHOLD {
                paint_constant(&mut image, pts, Luma([0.0f32]));
            } else {
                paint_barycentric(&mut image, pts, [a.z, b.z, c.z], MAX_INTERPOLATED, |v| v as f32);
            }
        }
        Ok(image)
    }

    /// 双光源 Lambert 灰度图
    pub fn render_lambert(&mut self, avatar: &Avatar<'_>, width: u32, height: u32) -> Result<GrayImage> {
        Self::require_mesh(avatar)?;
        let proj = self.prepare(avatar)?;
        let cloud = avatar.cloud();
        let mesh = avatar.model().mesh();

        // 顶点法线：相邻面法线之和，朝向相机
        let mut visible = vec![false; mesh.len()];
        let mut normals = vec![DVec3::ZERO; cloud.len()];
        for (i, face) in mesh.iter().enumerate() {
            let n = face_normal(cloud[face[0]], cloud[face[1]], cloud[face[2]]);
            for &v in face {
                normals[v] += n;
            }
            visible[i] = n.z.abs() > LAMBERT_VISIBLE_THRESHOLD;
        }
        for n in &mut normals {
            *n = n.normalize_or_zero();
            if n.z > 0.0 {
                *n = -*n;
            }
        }

        let shade = |v: usize| {
            let p = cloud[v];
            let n = normals[v];
            let main = (MAIN_LIGHT - p).normalize_or_zero().dot(n) * MAIN_LIGHT_INTENSITY;
            let back = (BACK_LIGHT - p).normalize_or_zero().dot(n) * BACK_LIGHT_INTENSITY;
            ((main + back) * 255.0).max(0.0)
        };

        let mut image = GrayImage::new(width, height);
        for &f in &proj.faces {
            if !visible[f] {
                continue;
            }
            let face = mesh[f];
            let pts = face.map(|v| proj.points[v]);
            let values = face.map(|v| shade(v));
            paint_barycentric(&mut image, pts, values, MAX_INTERPOLATED, |v| v as u8);
        }
        Ok(image)
    }

    /// 部位标签图：每个像素取最近顶点的主关节（可经 `part_map` 映射）
    ///
    /// 侧对相机的面填充 255。
    pub fn render_part_mask(
        &mut self,
        avatar: &Avatar<'_>,
        width: u32,
        height: u32,
        part_map: Option<&PartMap>,
    ) -> Result<GrayImage> {
        Self::require_mesh(avatar)?;
        let model = avatar.model();
        let n_joints = model.joint_count();
        match part_map {
            Some(map) if map.len() != n_joints => {
                return Err(AvatarError::DimensionMismatch {
                    what: "part map",
                    expected: n_joints,
                    actual: map.len(),
                });
            }
            None if n_joints >= PART_BACKGROUND as usize => {
                return Err(AvatarError::InvalidState(format!(
                    "{} joints do not fit into 8-bit part ids, supply a part map",
                    n_joints
                )));
            }
            _ => {}
        }
        let label = |point: usize| {
            let joint = model.dominant_joint(point);
            match part_map {
                Some(map) => map.part(joint),
                None => joint as u8,
            }
        };

        let proj = self.prepare(avatar)?;
        let cloud = avatar.cloud();
        let mesh = model.mesh();

        let mut image = GrayImage::from_pixel(width, height, Luma([PART_BACKGROUND]));
        for &f in &proj.faces {
            let face = mesh[f];
            let pts = face.map(|v| proj.points[v]);
            let [a, b, c] = face.map(|v| cloud[v]);
            if face_normal(a, b, c).z.abs() < EDGE_ON_THRESHOLD {
                paint_constant(&mut image, pts, Luma([PART_BACKGROUND]));
            } else {
                paint_nearest(&mut image, pts, face.map(|v| label(v)));
            }
        }
        Ok(image)
    }

    /// 面索引图：每个像素记录覆盖它的（最近的）原始面编号
    pub fn render_face_index(
        &mut self,
        avatar: &Avatar<'_>,
        width: u32,
        height: u32,
    ) -> Result<FaceIndexImage> {
        Self::require_mesh(avatar)?;
        let proj = self.prepare(avatar)?;
        let mesh = avatar.model().mesh();

        let mut image = FaceIndexImage::from_pixel(width, height, Luma([FACE_BACKGROUND]));
        for &f in &proj.faces {
            let pts = mesh[f].map(|v| proj.points[v]);
            paint_constant(&mut image, pts, Luma([f as i32]));
        }
        Ok(image)
    }
}

impl Default for AvatarRenderer {
    fn default() -> Self {
        Self::new(CameraIntrinsics::default())
    }
}

/// 单位面法线；面积为零时返回零向量（按侧对处理）
#[inline]
fn face_normal(a: DVec3, b: DVec3, c: DVec3) -> DVec3 {
    (b - a).cross(c - a).normalize_or_zero()
}
