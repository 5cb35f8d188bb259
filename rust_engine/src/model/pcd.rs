//! ASCII PCD 点云读取
//!
//! 直接读成扁平向量 x1 y1 z1 x2 y2 z2 ...，这样形状键可以作为同样布局的列向量直接相加。

use std::path::Path;

use nalgebra::DVector;

use super::tokens::{read_text, TokenReader};
use crate::{AvatarError, Result};

/// 读取 PCD 文件中的点，返回 3·点数 长度的向量
pub fn load_pcd_points<P: AsRef<Path>>(path: P) -> Result<DVector<f64>> {
    let path = path.as_ref();
    let text = read_text(path)?;
    parse_pcd(path, &text)
}

fn parse_pcd(path: &Path, text: &str) -> Result<DVector<f64>> {
    let mut n_points: Option<usize> = None;
    let mut data_offset = None;
    let mut offset = 0;

    for line in text.split_inclusive('\n') {
        offset += line.len();
        let mut fields = line.split_whitespace();
        match fields.next() {
            Some("WIDTH") => {
                let width = fields
                    .next()
                    .and_then(|w| w.parse::<usize>().ok())
                    .ok_or_else(|| AvatarError::asset(path, "invalid WIDTH field"))?;
                n_points = Some(width);
            }
            Some("DATA") => {
                if n_points.is_none() {
                    return Err(AvatarError::asset(
                        path,
                        "no WIDTH field before DATA, point count unknown",
                    ));
                }
                match fields.next() {
                    Some("ascii") => {}
                    other => {
                        return Err(AvatarError::asset(
                            path,
                            format!("unsupported PCD encoding {:?}, only ascii is supported", other),
                        ))
                    }
                }
                data_offset = Some(offset);
                break;
            }
            _ => {}
        }
    }

    let (n_points, data_offset) = match (n_points, data_offset) {
        (Some(n), Some(off)) => (n, off),
        _ => return Err(AvatarError::asset(path, "unexpected EOF before DATA")),
    };

    let mut tokens = TokenReader::new(path, &text[data_offset..]);
    tokens.ensure_tokens("WIDTH", n_points, 3)?;
    let mut result = DVector::zeros(n_points * 3);
    for i in 0..n_points * 3 {
        result[i] = tokens.next("point coordinate")?;
    }
    Ok(result)
}
