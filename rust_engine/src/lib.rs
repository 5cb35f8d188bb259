//! Avatar Engine - 可变形人体模型与软件光栅化器
//!
//! 为随机森林身体部位分类器生成合成训练数据：
//! - 人体模型（骨骼、蒙皮权重、形状键、关节回归器）加载
//! - 形状混合 + 前向运动学 + 线性混合蒙皮
//! - 姿态采样（姿态先验 / 动作捕捉序列）与关节拟合
//! - 深度 / 光照 / 部位标签 / 面索引图像的软件光栅化

pub mod avatar;
pub mod camera;
pub mod model;
pub mod prior;
pub mod render;
pub mod sequence;
pub mod skeleton;
pub mod synth;

pub use avatar::{Avatar, RootSampling};
pub use camera::CameraIntrinsics;
pub use model::{load_model, BodyModel, JointLocalization, ModelCapabilities, ModelData};
pub use prior::GaussianMixture;
pub use render::{AvatarRenderer, DepthImage, FaceIndexImage, PartMap};
pub use sequence::PoseSequence;
pub use skeleton::SmplJoint;
pub use synth::{SampleGenerator, SynthConfig, SyntheticSample};

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AvatarError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to load asset {path}: {reason}")]
    AssetLoad { path: PathBuf, reason: String },

    #[error("Model capability unavailable: {0}")]
    MissingCapability(&'static str),

    #[error("Dimension mismatch for {what}: expected {expected}, got {actual}")]
    DimensionMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Frame {frame} out of range (sequence has {count} frames)")]
    FrameOutOfRange { frame: usize, count: usize },

    #[error("Unknown subsequence: {0}")]
    UnknownSubsequence(String),

    #[error("Image error: {0}")]
    Image(String),
}

impl AvatarError {
    pub(crate) fn asset(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        AvatarError::AssetLoad {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, AvatarError>;
