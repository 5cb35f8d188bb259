//! 动作捕捉姿态序列
//!
//! 二进制帧文件 `X.dat` 由连续的小端 f64 帧组成；
//! 旁路索引 `X.dat.txt` 给出子序列数、总帧数、每帧字节数以及各子序列的起始字节与名称。
//! 每帧为根位置 (3) 加上每个关节一个 x,y,z,w 四元数。

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt};
use glam::{DQuat, DVec3};
use rand::Rng;

use crate::avatar::Avatar;
use crate::model::tokens::{read_text, TokenReader};
use crate::{AvatarError, Result};

const SCALAR_BYTES: usize = std::mem::size_of::<f64>();

/// 姿态序列，可按帧流式读取或整体预加载
#[derive(Clone, Debug)]
pub struct PoseSequence {
    path: PathBuf,
    num_frames: usize,
    /// 每帧标量数
    frame_size: usize,
    /// 子序列名称 → 起始帧
    subsequences: BTreeMap<String, usize>,
    /// 预加载的全部帧（帧主序）
    data: Option<Vec<f64>>,
}

impl PoseSequence {
    /// 打开序列；索引文件为 `<path>.txt`
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut meta_name = path.clone().into_os_string();
        meta_name.push(".txt");
        let meta_path = PathBuf::from(meta_name);

        let text = read_text(&meta_path)?;
        let mut tokens = TokenReader::new(&meta_path, &text);
        let n_subseq: usize = tokens.next("subsequence count")?;
        let num_frames: usize = tokens.next("frame count")?;
        let frame_bytes: usize = tokens.next("frame size")?;
        if frame_bytes == 0 || frame_bytes % SCALAR_BYTES != 0 {
            return Err(tokens.error(format!("invalid frame size {} bytes", frame_bytes)));
        }

        let mut subsequences = BTreeMap::new();
        for _ in 0..n_subseq {
            let start_byte: usize = tokens.next("subsequence start")?;
            let name: String = tokens.next("subsequence name")?;
            subsequences.insert(name, start_byte / frame_bytes);
        }

        let frame_size = frame_bytes / SCALAR_BYTES;
        let file_len = std::fs::metadata(&path)
            .map_err(|e| AvatarError::asset(&path, format!("cannot stat sequence: {}", e)))?
            .len();
        let needed = num_frames
            .checked_mul(frame_bytes)
            .and_then(|n| u64::try_from(n).ok())
            .ok_or_else(|| {
                AvatarError::asset(
                    &meta_path,
                    format!("{} frames of {} bytes overflow", num_frames, frame_bytes),
                )
            })?;
        if file_len < needed {
            return Err(AvatarError::asset(
                &path,
                format!("sequence holds {} bytes, index declares {}", file_len, needed),
            ));
        }

        log::info!(
            "姿态序列: {} 帧, 每帧 {} 个标量, {} 个子序列 ({})",
            num_frames,
            frame_size,
            subsequences.len(),
            path.display()
        );

        Ok(Self {
            path,
            num_frames,
            frame_size,
            subsequences,
            data: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn num_frames(&self) -> usize {
        self.num_frames
    }

    /// 每帧标量数
    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// 帧中编码的关节数
    pub fn joint_count(&self) -> usize {
        self.frame_size.saturating_sub(3) / 4
    }

    pub fn is_preloaded(&self) -> bool {
        self.data.is_some()
    }

    /// 把整个序列读入内存，之后的读帧不再访问文件
    pub fn preload(&mut self) -> Result<()> {
        if self.data.is_some() {
            return Ok(());
        }
        let mut reader = self.open_reader()?;
        let mut data = vec![0.0; self.num_frames * self.frame_size];
        reader
            .read_f64_into::<LittleEndian>(&mut data)
            .map_err(|e| AvatarError::asset(&self.path, format!("cannot preload frames: {}", e)))?;
        log::info!("姿态序列已预加载: {} 帧", self.num_frames);
        self.data = Some(data);
        Ok(())
    }

    /// 读取一帧的原始标量
    pub fn frame(&self, frame: usize) -> Result<Vec<f64>> {
        if frame >= self.num_frames {
            return Err(AvatarError::FrameOutOfRange {
                frame,
                count: self.num_frames,
            });
        }
        if let Some(data) = &self.data {
            let start = frame * self.frame_size;
            return Ok(data[start..start + self.frame_size].to_vec());
        }

        let mut reader = self.open_reader()?;
        reader.seek(SeekFrom::Start((frame * self.frame_size * SCALAR_BYTES) as u64))?;
        let mut out = vec![0.0; self.frame_size];
        reader
            .read_f64_into::<LittleEndian>(&mut out)
            .map_err(|e| AvatarError::asset(&self.path, format!("cannot read frame {}: {}", frame, e)))?;
        Ok(out)
    }

    /// 子序列的起始帧
    pub fn subsequence(&self, name: &str) -> Result<usize> {
        self.subsequences
            .get(name)
            .copied()
            .ok_or_else(|| AvatarError::UnknownSubsequence(name.to_string()))
    }

    pub fn subsequences(&self) -> &BTreeMap<String, usize> {
        &self.subsequences
    }

    /// 用第 `frame` 帧设置实例的根位置与全部关节旋转
    pub fn pose_avatar(&self, avatar: &mut Avatar<'_>, frame: usize) -> Result<()> {
        let n_joints = avatar.model().joint_count();
        let expected = 3 + 4 * n_joints;
        if self.frame_size != expected {
            return Err(AvatarError::DimensionMismatch {
                what: "pose sequence frame size",
                expected,
                actual: self.frame_size,
            });
        }

        let data = self.frame(frame)?;
        let rotations = data[3..]
            .chunks_exact(4)
            .map(|q| {
                let q = DQuat::from_xyzw(q[0], q[1], q[2], q[3]);
                if q.length_squared() > f64::EPSILON && q.is_finite() {
                    q.normalize()
                } else {
                    DQuat::IDENTITY
                }
            })
            .collect();

        avatar.set_root_position(DVec3::new(data[0], data[1], data[2]));
        avatar.set_local_rotations(rotations)
    }

    /// 随机选一帧设置实例，返回所选帧号
    pub fn pose_avatar_random<R: Rng + ?Sized>(
        &self,
        avatar: &mut Avatar<'_>,
        rng: &mut R,
    ) -> Result<usize> {
        if self.num_frames == 0 {
            return Err(AvatarError::InvalidState(
                "pose sequence has no frames".to_string(),
            ));
        }
        let frame = rng.gen_range(0..self.num_frames);
        self.pose_avatar(avatar, frame)?;
        Ok(frame)
    }

    fn open_reader(&self) -> Result<BufReader<File>> {
        let file = File::open(&self.path)
            .map_err(|e| AvatarError::asset(&self.path, format!("cannot open sequence: {}", e)))?;
        Ok(BufReader::new(file))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::testing::chain_model;
    use byteorder::WriteBytesExt;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::io::Write;

    /// 3 关节序列：每帧根位置 (f, 0, 2)，关节 1 绕 z 轴旋转 0.1·f
    fn write_sequence(dir: &Path, frames: usize) -> PathBuf {
        let path = dir.join("mocap.dat");
        let frame_size = 3 + 4 * 3;
        let mut file = File::create(&path).unwrap();
        for f in 0..frames {
            let mut values = vec![f as f64, 0.0, 2.0];
            let r1 = DQuat::from_rotation_z(0.1 * f as f64);
            // 根与关节 2 故意存非单位四元数，读取时应归一化
            values.extend([0.0, 0.0, 0.0, 2.0]);
            values.extend([r1.x, r1.y, r1.z, r1.w]);
            values.extend([0.0, 0.0, 0.0, 0.0]);
            assert_eq!(values.len(), frame_size);
            for v in values {
                file.write_f64::<LittleEndian>(v).unwrap();
            }
        }
        let bytes = frame_size * SCALAR_BYTES;
        let mut meta = File::create(dir.join("mocap.dat.txt")).unwrap();
        writeln!(meta, "2 {} {}", frames, bytes).unwrap();
        writeln!(meta, "0 walk").unwrap();
        writeln!(meta, "{} jump", 3 * bytes).unwrap();
        path
    }

    #[test]
    fn test_open_reads_index() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_sequence(tmp.path(), 5);
        let seq = PoseSequence::open(&path).unwrap();
        assert_eq!(seq.num_frames(), 5);
        assert_eq!(seq.frame_size(), 15);
        assert_eq!(seq.joint_count(), 3);
        assert_eq!(seq.subsequence("walk").unwrap(), 0);
        assert_eq!(seq.subsequence("jump").unwrap(), 3);
        assert!(matches!(
            seq.subsequence("swim"),
            Err(AvatarError::UnknownSubsequence(_))
        ));
        assert_eq!(seq.subsequences().len(), 2);
    }

    #[test]
    fn test_streaming_and_preloaded_frames_match() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_sequence(tmp.path(), 4);
        let mut seq = PoseSequence::open(&path).unwrap();
        let streamed = seq.frame(2).unwrap();
        assert_eq!(streamed[0], 2.0);

        seq.preload().unwrap();
        assert!(seq.is_preloaded());
        assert_eq!(seq.frame(2).unwrap(), streamed);
        assert!(matches!(
            seq.frame(4),
            Err(AvatarError::FrameOutOfRange { frame: 4, count: 4 })
        ));
    }

    #[test]
    fn test_pose_avatar() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_sequence(tmp.path(), 4);
        let seq = PoseSequence::open(&path).unwrap();
        let model = chain_model();
        let mut avatar = Avatar::new(&model);

        seq.pose_avatar(&mut avatar, 3).unwrap();
        assert_eq!(avatar.root_position(), DVec3::new(3.0, 0.0, 2.0));
        assert_eq!(avatar.root_rotation(), DQuat::IDENTITY);
        assert!(avatar.local_rotation(1).dot(DQuat::from_rotation_z(0.3)).abs() > 1.0 - 1e-9);
        assert_eq!(avatar.local_rotation(2), DQuat::IDENTITY);
        assert!(avatar.is_stale());

        let frame = seq
            .pose_avatar_random(&mut avatar, &mut StdRng::seed_from_u64(11))
            .unwrap();
        assert!(frame < 4);
        assert_eq!(avatar.root_position().x, frame as f64);
    }

    #[test]
    fn test_truncated_sequence_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_sequence(tmp.path(), 2);
        let bytes = 15 * SCALAR_BYTES;
        std::fs::write(
            tmp.path().join("mocap.dat.txt"),
            format!("0 10 {}\n", bytes),
        )
        .unwrap();
        assert!(matches!(
            PoseSequence::open(&path),
            Err(AvatarError::AssetLoad { .. })
        ));
    }

    #[test]
    fn test_overflowing_index_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_sequence(tmp.path(), 2);
        std::fs::write(tmp.path().join("mocap.dat.txt"), "0 2305843009213693952 8\n").unwrap();
        match PoseSequence::open(&path) {
            Err(AvatarError::AssetLoad { reason, .. }) => assert!(reason.contains("overflow")),
            other => panic!("unexpected result {:?}", other.map(|s| s.num_frames())),
        }
    }

    #[test]
    fn test_missing_index_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(matches!(
            PoseSequence::open(tmp.path().join("none.dat")),
            Err(AvatarError::AssetLoad { .. })
        ));
    }
}
