//! 人体模型目录加载器
//!
//! 目录结构：
//! - `model.pcd`                 基础点云（必需）
//! - `skeleton.txt`              骨骼与蒙皮权重（必需）
//! - `shapekey/*.pcd`            形状键（可选）
//! - `joint_shape_regressor.txt` 关节形状回归器（可选，优先）
//! - `joint_regressor.txt`       稀疏关节回归器（可选）
//! - `pose_prior.txt`            高斯混合姿态先验（可选）
//! - `mesh.txt`                  三角形网格（可选）

use std::fs;
use std::path::Path;

use glam::DVec3;
use nalgebra::{DMatrix, DVector};

use super::pcd::load_pcd_points;
use super::tokens::{read_optional_text, read_text, TokenReader};
use super::{BodyModel, JointLocalization, JointRegressor, JointWeight, ModelData, PointWeight};
use crate::prior::GaussianMixture;
use crate::{AvatarError, Result};

/// 骨骼文件内容
struct Skeleton {
    parents: Vec<i32>,
    names: Vec<String>,
    positions: Vec<DVec3>,
    point_weights: Vec<Vec<JointWeight>>,
}

/// 从模型目录加载人体模型
///
/// 必需文件缺失或任何文件格式错误都返回 `AssetLoad`；
/// 可选文件缺失只输出警告，并在 `capabilities()` 中体现。
pub fn load_model<P: AsRef<Path>>(model_dir: P, limit_one_joint_per_point: bool) -> Result<BodyModel> {
    let dir = model_dir.as_ref();

    let base_points = load_pcd_points(dir.join("model.pcd"))?;
    let skeleton = load_skeleton(&dir.join("skeleton.txt"))?;
    let n_joints = skeleton.parents.len();
    let n_points = skeleton.point_weights.len();

    if base_points.len() != 3 * n_points {
        return Err(AvatarError::asset(
            dir.join("model.pcd"),
            format!(
                "point cloud has {} points but skeleton declares {}",
                base_points.len() / 3,
                n_points
            ),
        ));
    }

    let shape_keys = load_shape_keys(&dir.join("shapekey"), n_points)?;
    let localization = load_localization(dir, n_joints, n_points, shape_keys.ncols())?;

    let prior_path = dir.join("pose_prior.txt");
    let pose_prior = if prior_path.is_file() {
        Some(GaussianMixture::load(&prior_path)?)
    } else {
        log::warn!("姿态先验不存在: {}，无法随机采样姿态", prior_path.display());
        None
    };

    let mesh = load_mesh(&dir.join("mesh.txt"), n_points)?;
    if mesh.is_none() {
        log::warn!("网格文件不存在，渲染功能不可用: {}", dir.join("mesh.txt").display());
    }

    let data = ModelData {
        parents: skeleton.parents,
        joint_names: skeleton.names,
        initial_joint_pos: skeleton.positions,
        base_points,
        shape_keys,
        point_weights: skeleton.point_weights,
        localization,
        mesh,
        pose_prior,
    };

    let model = BodyModel::from_data(data, limit_one_joint_per_point)
        .map_err(|e| AvatarError::asset(dir, e.to_string()))?
        .with_source(dir.to_path_buf());

    log::info!(
        "人体模型加载完成: {} 个关节, {} 个点, {} 个形状键, {} 个面 ({})",
        model.joint_count(),
        model.point_count(),
        model.shape_key_count(),
        model.face_count(),
        dir.display()
    );
    Ok(model)
}

/// 骨骼文件：`nJoints nPoints`，每关节 `id parent name x y z`，
/// 然后每点 `nEntries (joint weight)*`
fn load_skeleton(path: &Path) -> Result<Skeleton> {
    let text = read_text(path)?;
    let mut tokens = TokenReader::new(path, &text);

    let n_joints = tokens.count("joint count", 6)?;
    let n_points = tokens.count("point count", 1)?;
    if n_joints == 0 {
        return Err(tokens.error("skeleton declares zero joints"));
    }

    let mut parents = vec![-1i32; n_joints];
    let mut names = vec![String::new(); n_joints];
    let mut positions = vec![DVec3::ZERO; n_joints];
    let mut seen = vec![false; n_joints];
    for _ in 0..n_joints {
        let id: usize = tokens.next("joint id")?;
        if id >= n_joints || seen[id] {
            return Err(tokens.error(format!("invalid or duplicate joint id {}", id)));
        }
        seen[id] = true;
        parents[id] = tokens.next("joint parent")?;
        names[id] = tokens.next("joint name")?;
        positions[id] = DVec3::new(
            tokens.next("joint x")?,
            tokens.next("joint y")?,
            tokens.next("joint z")?,
        );
    }
    parents[0] = -1;

    let mut point_weights = Vec::with_capacity(n_points);
    for _ in 0..n_points {
        let n_entries = tokens.count("assignment count", 2)?;
        let mut list = Vec::with_capacity(n_entries);
        for _ in 0..n_entries {
            let joint: usize = tokens.next("assigned joint")?;
            let weight: f64 = tokens.next("assignment weight")?;
            list.push(JointWeight { weight, joint });
        }
        point_weights.push(list);
    }

    Ok(Skeleton {
        parents,
        names,
        positions,
        point_weights,
    })
}

/// 形状键目录，按文件名排序作为基的列顺序
fn load_shape_keys(dir: &Path, n_points: usize) -> Result<DMatrix<f64>> {
    if !dir.is_dir() {
        log::warn!("形状键目录不存在: {}", dir.display());
        return Ok(DMatrix::zeros(3 * n_points, 0));
    }

    let mut files = fs::read_dir(dir)
        .map_err(|e| AvatarError::asset(dir, format!("cannot list shape keys: {}", e)))?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(|e| AvatarError::asset(dir, format!("cannot list shape keys: {}", e)))?;
    files.retain(|p| p.is_file());
    files.sort();

    let mut keys = DMatrix::zeros(3 * n_points, files.len());
    for (i, file) in files.iter().enumerate() {
        let key = load_pcd_points(file)?;
        if key.len() != 3 * n_points {
            return Err(AvatarError::asset(
                file,
                format!("shape key has {} points, expected {}", key.len() / 3, n_points),
            ));
        }
        keys.set_column(i, &key);
    }
    Ok(keys)
}

/// 关节形状回归器优先，其次稀疏关节回归器，都不存在时不可用
fn load_localization(
    dir: &Path,
    n_joints: usize,
    n_points: usize,
    n_keys: usize,
) -> Result<JointLocalization> {
    if let Some((path, text)) = read_optional_text(&dir.join("joint_shape_regressor.txt"))? {
        let mut tokens = TokenReader::new(&path, &text);
        let file_keys: usize = tokens.next("shape key count")?;
        if file_keys != n_keys {
            return Err(tokens.error(format!(
                "regressor expects {} shape keys, model has {}",
                file_keys, n_keys
            )));
        }
        let mut base = DVector::zeros(3 * n_joints);
        for i in 0..base.len() {
            base[i] = tokens.next("regressor base")?;
        }
        let mut matrix = DMatrix::zeros(3 * n_joints, n_keys);
        for r in 0..matrix.nrows() {
            for c in 0..n_keys {
                matrix[(r, c)] = tokens.next("regressor entry")?;
            }
        }
        return Ok(JointLocalization::ShapeRegressor { base, matrix });
    }

    if let Some((path, text)) = read_optional_text(&dir.join("joint_regressor.txt"))? {
        let mut tokens = TokenReader::new(&path, &text);
        let file_joints: usize = tokens.next("joint count")?;
        if file_joints != n_joints {
            return Err(tokens.error(format!(
                "regressor has {} joints, skeleton has {}",
                file_joints, n_joints
            )));
        }
        let mut columns = Vec::with_capacity(n_joints);
        for _ in 0..n_joints {
            let n_entries = tokens.count("regressor entry count", 2)?;
            let mut col = Vec::with_capacity(n_entries);
            for _ in 0..n_entries {
                let point: usize = tokens.next("regressor point")?;
                let weight: f64 = tokens.next("regressor weight")?;
                if point >= n_points {
                    return Err(tokens.error(format!("regressor point {} out of range", point)));
                }
                col.push(PointWeight { weight, point });
            }
            columns.push(col);
        }
        return Ok(JointLocalization::SparseRegressor(JointRegressor::new(columns)));
    }

    log::warn!("未找到关节回归器或关节形状回归器，形状改变后关节位置将不准确");
    Ok(JointLocalization::Unavailable)
}

/// 网格文件：`nFaces` 后跟 nFaces 个顶点索引三元组
fn load_mesh(path: &Path, n_points: usize) -> Result<Option<Vec<[usize; 3]>>> {
    let Some((path, text)) = read_optional_text(path)? else {
        return Ok(None);
    };
    let mut tokens = TokenReader::new(&path, &text);
    let n_faces = tokens.count("face count", 3)?;
    let mut faces = Vec::with_capacity(n_faces);
    for _ in 0..n_faces {
        let face = [
            tokens.next::<usize>("face index")?,
            tokens.next::<usize>("face index")?,
            tokens.next::<usize>("face index")?,
        ];
        if face.iter().any(|&v| v >= n_points) {
            return Err(tokens.error(format!("face {:?} references a missing point", face)));
        }
        faces.push(face);
    }
    Ok(Some(faces))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::PathBuf;

    fn write_pcd(path: &Path, points: &[[f64; 3]]) {
        let mut text = format!(
            "VERSION 0.7\nFIELDS x y z\nWIDTH {}\nHEIGHT 1\nPOINTS {}\nDATA ascii\n",
            points.len(),
            points.len()
        );
        for p in points {
            text.push_str(&format!("{} {} {}\n", p[0], p[1], p[2]));
        }
        fs::write(path, text).unwrap();
    }

    /// 三关节、四点的最小模型目录
    fn write_model_dir(dir: &Path) {
        write_pcd(
            &dir.join("model.pcd"),
            &[[0.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.1, 2.0, 0.0], [-0.1, 2.0, 0.0]],
        );
        fs::write(
            dir.join("skeleton.txt"),
            "3 4\n\
             0 -1 root 0 0 0\n\
             1 0 mid 0 1 0\n\
             2 1 tip 0 2 0\n\
             1 0 1.0\n\
             2 1 0.5 0 0.5\n\
             1 2 1.0\n\
             2 1 0.2 2 0.8\n",
        )
        .unwrap();
        fs::write(dir.join("mesh.txt"), "2\n0 1 2\n1 3 2\n").unwrap();
    }

    fn model_dir() -> (tempfile::TempDir, PathBuf) {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().to_path_buf();
        write_model_dir(&path);
        (tmp, path)
    }

    #[test]
    fn test_load_minimal_model() {
        let (_tmp, dir) = model_dir();
        let model = load_model(&dir, false).unwrap();
        assert_eq!(model.joint_count(), 3);
        assert_eq!(model.point_count(), 4);
        assert_eq!(model.face_count(), 2);
        assert_eq!(model.shape_key_count(), 0);
        assert_eq!(model.parents(), &[-1, 0, 1]);
        assert_eq!(model.joint_names()[2], "tip");
        assert_eq!(model.initial_joint_positions()[1], DVec3::new(0.0, 1.0, 0.0));
        assert_eq!(model.source(), Some(dir.as_path()));

        let caps = model.capabilities();
        assert!(caps.mesh);
        assert!(!caps.joint_localization);
        assert!(!caps.pose_prior);
        // 点 3 的主关节是 2
        assert_eq!(model.dominant_joint(3), 2);
    }

    #[test]
    fn test_load_shape_keys_and_regressor() {
        let (_tmp, dir) = model_dir();
        fs::create_dir(dir.join("shapekey")).unwrap();
        let key = [[1.0, 0.0, 0.0]; 4];
        write_pcd(&dir.join("shapekey").join("shape000.pcd"), &key);
        write_pcd(&dir.join("shapekey").join("shape001.pcd"), &[[0.0, 1.0, 0.0]; 4]);
        fs::write(
            dir.join("joint_regressor.txt"),
            "3\n1 0 1.0\n1 1 1.0\n2 2 0.5 3 0.5\n",
        )
        .unwrap();

        let model = load_model(&dir, false).unwrap();
        assert_eq!(model.shape_key_count(), 2);
        assert_eq!(model.shape_keys()[(0, 0)], 1.0);
        assert_eq!(model.shape_keys()[(1, 1)], 1.0);
        match model.localization() {
            JointLocalization::SparseRegressor(reg) => {
                let joints = reg.regress(model.base_points());
                assert!((joints[2] - DVec3::new(0.0, 2.0, 0.0)).length() < 1e-12);
            }
            other => panic!("unexpected localization {:?}", other),
        }
    }

    #[test]
    fn test_shape_regressor_takes_precedence() {
        let (_tmp, dir) = model_dir();
        fs::write(dir.join("joint_regressor.txt"), "3\n1 0 1.0\n1 1 1.0\n1 2 1.0\n").unwrap();
        fs::write(
            dir.join("joint_shape_regressor.txt"),
            "0\n0 0 0  0 1 0  0 2 0\n",
        )
        .unwrap();
        let model = load_model(&dir, false).unwrap();
        assert!(matches!(
            model.localization(),
            JointLocalization::ShapeRegressor { .. }
        ));
    }

    #[test]
    fn test_missing_skeleton_is_error() {
        let (_tmp, dir) = model_dir();
        fs::remove_file(dir.join("skeleton.txt")).unwrap();
        match load_model(&dir, false) {
            Err(AvatarError::AssetLoad { path, .. }) => assert!(path.ends_with("skeleton.txt")),
            other => panic!("unexpected result {:?}", other.map(|m| m.joint_count())),
        }
    }

    #[test]
    fn test_truncated_skeleton_is_error() {
        let (_tmp, dir) = model_dir();
        fs::write(dir.join("skeleton.txt"), "3 4\n0 -1 root 0 0 0\n1 0 mid 0 1 0\n").unwrap();
        assert!(matches!(
            load_model(&dir, false),
            Err(AvatarError::AssetLoad { .. })
        ));
    }

    #[test]
    fn test_point_count_mismatch() {
        let (_tmp, dir) = model_dir();
        write_pcd(&dir.join("model.pcd"), &[[0.0, 0.0, 0.0]]);
        assert!(matches!(
            load_model(&dir, false),
            Err(AvatarError::AssetLoad { .. })
        ));
    }

    #[test]
    fn test_bad_mesh_index() {
        let (_tmp, dir) = model_dir();
        fs::write(dir.join("mesh.txt"), "1\n0 1 7\n").unwrap();
        assert!(load_model(&dir, false).is_err());
    }

    #[test]
    fn test_oversized_counts_are_errors() {
        let huge = usize::MAX;
        let skeletons = [
            format!("{} 4\n0 -1 root 0 0 0\n", huge),
            format!("3 {}\n0 -1 root 0 0 0\n", huge),
            format!(
                "3 4\n0 -1 root 0 0 0\n1 0 mid 0 1 0\n2 1 tip 0 2 0\n{} 0 1.0\n",
                huge
            ),
        ];
        for text in &skeletons {
            let (_tmp, dir) = model_dir();
            fs::write(dir.join("skeleton.txt"), text).unwrap();
            match load_model(&dir, false) {
                Err(AvatarError::AssetLoad { path, .. }) => assert!(path.ends_with("skeleton.txt")),
                other => panic!("unexpected result {:?}", other.map(|m| m.joint_count())),
            }
        }

        let (_tmp, dir) = model_dir();
        fs::write(dir.join("mesh.txt"), format!("{}\n0 1 2\n", huge)).unwrap();
        match load_model(&dir, false) {
            Err(AvatarError::AssetLoad { path, .. }) => assert!(path.ends_with("mesh.txt")),
            other => panic!("unexpected result {:?}", other.map(|m| m.face_count())),
        }

        let (_tmp, dir) = model_dir();
        fs::write(dir.join("joint_regressor.txt"), format!("3\n{} 0 1.0\n", huge)).unwrap();
        assert!(matches!(
            load_model(&dir, false),
            Err(AvatarError::AssetLoad { .. })
        ));
    }

    #[test]
    fn test_pose_prior_dimension_checked() {
        let (_tmp, dir) = model_dir();
        // 3 关节 => 先验应为 6 维，这里给 2 维
        fs::write(dir.join("pose_prior.txt"), "1 2\n1\n0 0\n1 0\n0 1\n").unwrap();
        assert!(matches!(
            load_model(&dir, false),
            Err(AvatarError::AssetLoad { .. })
        ));
    }
}
