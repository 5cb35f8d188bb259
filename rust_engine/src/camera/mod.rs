//! 针孔相机内参

use std::fs;
use std::path::Path;

use glam::{DVec2, DVec3};

use crate::{AvatarError, Result};

/// 针孔相机内参 (fx, fy, cx, cy)
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CameraIntrinsics {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
}

impl CameraIntrinsics {
    pub fn new(fx: f64, fy: f64, cx: f64, cy: f64) -> Self {
        Self { fx, fy, cx, cy }
    }

    /// 从文本文件读取内参，格式为 `fx fy cx cy`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|e| AvatarError::asset(path, format!("cannot read intrinsics: {}", e)))?;

        let values = text
            .split_whitespace()
            .map(|tok| tok.parse::<f64>())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| AvatarError::asset(path, format!("invalid scalar: {}", e)))?;

        if values.len() != 4 {
            return Err(AvatarError::asset(
                path,
                format!("expected 4 scalars (fx fy cx cy), found {}", values.len()),
            ));
        }
        Ok(Self::new(values[0], values[1], values[2], values[3]))
    }

    /// 投影相机坐标系中的点到像素坐标
    ///
    /// 相机 Y 轴向上，图像原点在左上角，因此 y 需要翻转。
    #[inline]
    pub fn project(&self, p: DVec3) -> DVec2 {
        DVec2::new(
            p.x * self.fx / p.z + self.cx,
            -p.y * self.fy / p.z + self.cy,
        )
    }
}

impl Default for CameraIntrinsics {
    /// Azure Kinect 深度相机出厂内参
    fn default() -> Self {
        Self {
            fx: 606.438,
            fy: 606.351,
            cx: 637.294,
            cy: 366.992,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_project_principal_point() {
        let intrin = CameraIntrinsics::new(500.0, 480.0, 320.0, 240.0);
        for z in [0.5, 1.0, 3.7, 100.0] {
            let p = intrin.project(DVec3::new(0.0, 0.0, z));
            assert!((p.x - 320.0).abs() < 1e-9);
            assert!((p.y - 240.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_project_offset() {
        let intrin = CameraIntrinsics::new(500.0, 480.0, 320.0, 240.0);
        let p = intrin.project(DVec3::new(0.2, 0.1, 2.0));
        assert!((p.x - (320.0 + 0.2 * 500.0 / 2.0)).abs() < 1e-9);
        // y 向上 => 图像上方
        assert!((p.y - (240.0 - 0.1 * 480.0 / 2.0)).abs() < 1e-9);
    }

    #[test]
    fn test_load() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "600.5 601.5\n320 240").unwrap();
        let intrin = CameraIntrinsics::load(file.path()).unwrap();
        assert_eq!(intrin, CameraIntrinsics::new(600.5, 601.5, 320.0, 240.0));
    }

    #[test]
    fn test_load_rejects_short_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "600.5 601.5 320").unwrap();
        let err = CameraIntrinsics::load(file.path()).unwrap_err();
        assert!(matches!(err, AvatarError::AssetLoad { .. }));
    }
}
