//! 合成训练样本生成
//!
//! 每个样本：随机姿态（动作捕捉帧或姿态先验）→ 随机形状与根变换 → `update()` →
//! 渲染深度图与部位标签图。样本 `i` 使用种子 `base_seed + i`，批量结果与线程数无关。

mod config;

pub use config::{get_config, reset_config, set_config, SynthConfig};

use std::fs;
use std::path::Path;

use image::{GrayImage, ImageBuffer, Luma};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;

use crate::avatar::Avatar;
use crate::camera::CameraIntrinsics;
use crate::model::BodyModel;
use crate::render::{AvatarRenderer, DepthImage, PartMap};
use crate::sequence::PoseSequence;
use crate::{AvatarError, Result};

/// 一对训练图像
#[derive(Clone, Debug)]
pub struct SyntheticSample {
    pub seed: u64,
    /// 使用的动作捕捉帧（姿态来自先验时为 `None`）
    pub frame: Option<usize>,
    pub depth: DepthImage,
    pub parts: GrayImage,
}

impl SyntheticSample {
    /// 深度转换为 16 位毫米值（超出范围截断，背景仍为 0）
    pub fn depth_millimeters(&self) -> ImageBuffer<Luma<u16>, Vec<u16>> {
        let (width, height) = self.depth.dimensions();
        ImageBuffer::from_fn(width, height, |x, y| {
            let mm = (self.depth.get_pixel(x, y)[0] as f64 * 1000.0).round();
            Luma([mm.clamp(0.0, u16::MAX as f64) as u16])
        })
    }

    /// 保存为 `<dir>/depth/<stem>.png`（毫米）与 `<dir>/part_mask/<stem>.png`
    pub fn save<P: AsRef<Path>>(&self, dir: P, stem: &str) -> Result<()> {
        let dir = dir.as_ref();
        let depth_dir = dir.join("depth");
        let part_dir = dir.join("part_mask");
        fs::create_dir_all(&depth_dir)?;
        fs::create_dir_all(&part_dir)?;

        let file = format!("{}.png", stem);
        self.depth_millimeters()
            .save(depth_dir.join(&file))
            .map_err(|e| AvatarError::Image(format!("cannot save depth image: {}", e)))?;
        self.parts
            .save(part_dir.join(&file))
            .map_err(|e| AvatarError::Image(format!("cannot save part mask: {}", e)))?;
        Ok(())
    }
}

/// 合成样本生成器，可跨线程共享
#[derive(Clone, Debug)]
pub struct SampleGenerator<'m> {
    model: &'m BodyModel,
    sequence: Option<&'m PoseSequence>,
    intrinsics: CameraIntrinsics,
    part_map: Option<PartMap>,
    config: SynthConfig,
}

impl<'m> SampleGenerator<'m> {
    /// 使用全局配置创建；模型必须带网格
    pub fn new(model: &'m BodyModel, intrinsics: CameraIntrinsics) -> Result<Self> {
        let caps = model.capabilities();
        if !caps.can_render() {
            return Err(AvatarError::MissingCapability("mesh"));
        }
        if !caps.can_sample_pose() {
            log::warn!("模型没有姿态先验，必须提供动作捕捉序列");
        }
        Ok(Self {
            model,
            sequence: None,
            intrinsics,
            part_map: None,
            config: get_config(),
        })
    }

    pub fn with_config(mut self, config: SynthConfig) -> Self {
        self.config = config;
        self
    }

    /// 从动作捕捉序列取姿态（替代姿态先验）
    pub fn with_sequence(mut self, sequence: &'m PoseSequence) -> Self {
        self.sequence = Some(sequence);
        self
    }

    pub fn with_part_map(mut self, part_map: PartMap) -> Self {
        self.part_map = Some(part_map);
        self
    }

    pub fn config(&self) -> &SynthConfig {
        &self.config
    }

    pub fn model(&self) -> &'m BodyModel {
        self.model
    }

    /// 生成单个样本
    pub fn generate(&self, seed: u64) -> Result<SyntheticSample> {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut avatar = Avatar::new(self.model);

        let frame = match self.sequence {
            Some(seq) => Some(seq.pose_avatar_random(&mut avatar, &mut rng)?),
            None => {
                avatar.randomize_pose(&mut rng)?;
                None
            }
        };
        if self.config.randomize_shape {
            avatar.randomize_shape(&mut rng);
        }
        avatar.randomize_root(&mut rng, &self.config.root_sampling());
        avatar.update();

        let (width, height) = (self.config.width, self.config.height);
        let mut renderer = AvatarRenderer::new(self.intrinsics);
        let depth = renderer.render_depth(&avatar, width, height)?;
        let parts = renderer.render_part_mask(&avatar, width, height, self.part_map.as_ref())?;

        log::debug!(
            "合成样本 seed={} frame={:?} root={:?}",
            seed,
            frame,
            avatar.root_position()
        );
        Ok(SyntheticSample {
            seed,
            frame,
            depth,
            parts,
        })
    }

    /// 并行生成 `count` 个样本，样本 `i` 的种子为 `base_seed + i`
    pub fn generate_batch(&self, count: usize, base_seed: u64) -> Result<Vec<SyntheticSample>> {
        (0..count)
            .into_par_iter()
            .map(|i| self.generate(base_seed.wrapping_add(i as u64)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::testing::chain_data;
    use crate::prior::GaussianMixture;
    use nalgebra::{DMatrix, DVector};

    fn prior_model() -> BodyModel {
        let mut data = chain_data();
        data.pose_prior = Some(
            GaussianMixture::new(
                vec![1.0],
                vec![DVector::zeros(6)],
                vec![DMatrix::identity(6, 6) * 0.01],
            )
            .unwrap(),
        );
        BodyModel::from_data(data, false).unwrap()
    }

    fn small_config() -> SynthConfig {
        SynthConfig {
            width: 64,
            height: 48,
            randomize_shape: false,
            azimuth_half_range: 0.0,
            perturb_sigma: 0.0,
            ..SynthConfig::default()
        }
    }

    fn camera() -> CameraIntrinsics {
        CameraIntrinsics::new(50.0, 50.0, 32.0, 24.0)
    }

    #[test]
    fn test_generate_is_deterministic() {
        let model = prior_model();
        let generator = SampleGenerator::new(&model, camera())
            .unwrap()
            .with_config(small_config());
        let a = generator.generate(5).unwrap();
        let b = generator.generate(5).unwrap();
        assert_eq!(a.depth, b.depth);
        assert_eq!(a.parts, b.parts);
        assert_eq!(a.depth.dimensions(), (64, 48));
        assert!(a.frame.is_none());
        // 朝向固定、根在视野内，人体一定可见
        assert!(a.depth.pixels().any(|p| p[0] > 0.0));
        assert!(a.parts.pixels().any(|p| p[0] < 3));
    }

    #[test]
    fn test_batch_matches_individual_seeds() {
        let model = prior_model();
        let generator = SampleGenerator::new(&model, camera())
            .unwrap()
            .with_config(SynthConfig {
                randomize_shape: true,
                ..small_config()
            });
        let batch = generator.generate_batch(4, 100).unwrap();
        assert_eq!(batch.len(), 4);
        for (i, sample) in batch.iter().enumerate() {
            assert_eq!(sample.seed, 100 + i as u64);
            let single = generator.generate(100 + i as u64).unwrap();
            assert_eq!(sample.parts, single.parts);
        }
    }

    #[test]
    fn test_part_map_applied() {
        let model = prior_model();
        let generator = SampleGenerator::new(&model, camera())
            .unwrap()
            .with_config(small_config())
            .with_part_map(PartMap::new(vec![7, 7, 7]).unwrap());
        let sample = generator.generate(1).unwrap();
        assert!(sample.parts.pixels().all(|p| p[0] == 7 || p[0] == 255));
    }

    #[test]
    fn test_save_sample() {
        let model = prior_model();
        let generator = SampleGenerator::new(&model, camera())
            .unwrap()
            .with_config(small_config());
        let sample = generator.generate(9).unwrap();
        let tmp = tempfile::tempdir().unwrap();
        sample.save(tmp.path(), "000009").unwrap();

        let parts = image::open(tmp.path().join("part_mask/000009.png"))
            .unwrap()
            .to_luma8();
        assert_eq!(parts, sample.parts);
        let depth = image::open(tmp.path().join("depth/000009.png"))
            .unwrap()
            .to_luma16();
        assert_eq!(depth, sample.depth_millimeters());
        assert!(depth.pixels().any(|p| p[0] > 2000));
    }

    #[test]
    fn test_requires_pose_source() {
        let model = BodyModel::from_data(chain_data(), false).unwrap();
        let generator = SampleGenerator::new(&model, camera()).unwrap();
        assert!(matches!(
            generator.generate(0),
            Err(AvatarError::MissingCapability("pose prior"))
        ));

        let mut data = chain_data();
        data.mesh = None;
        let model = BodyModel::from_data(data, false).unwrap();
        assert!(SampleGenerator::new(&model, camera()).is_err());
    }
}
