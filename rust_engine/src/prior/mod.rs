//! 高斯混合姿态先验
//!
//! 作用于除根关节外所有关节的轴角向量（3·(关节数-1) 维）。

use std::f64::consts::PI;
use std::path::Path;

use nalgebra::{DMatrix, DVector};
use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;
use rand_distr::StandardNormal;

use crate::model::tokens::{read_text, TokenReader};
use crate::{AvatarError, Result};

/// 单个高斯分量
#[derive(Clone, Debug)]
struct Component {
    mean: DVector<f64>,
    /// 协方差的 Cholesky 下三角因子 L（Σ = L·Lᵀ）
    chol: DMatrix<f64>,
    chol_inv: DMatrix<f64>,
    /// ln(w) - ½·ln det(2πΣ)
    log_norm: f64,
    /// 残差常数项（已平移，使最小值为 0）
    residual_const: f64,
}

/// 高斯混合模型
#[derive(Clone, Debug)]
pub struct GaussianMixture {
    dims: usize,
    weights: Vec<f64>,
    components: Vec<Component>,
    chooser: WeightedIndex<f64>,
}

impl GaussianMixture {
    /// 由权重、均值、协方差构建；权重会被归一化
    pub fn new(
        weights: Vec<f64>,
        means: Vec<DVector<f64>>,
        covariances: Vec<DMatrix<f64>>,
    ) -> Result<Self> {
        let n_comps = weights.len();
        if n_comps == 0 {
            return Err(AvatarError::InvalidState(
                "gaussian mixture needs at least one component".to_string(),
            ));
        }
        if means.len() != n_comps {
            return Err(AvatarError::DimensionMismatch {
                what: "mixture means",
                expected: n_comps,
                actual: means.len(),
            });
        }
        if covariances.len() != n_comps {
            return Err(AvatarError::DimensionMismatch {
                what: "mixture covariances",
                expected: n_comps,
                actual: covariances.len(),
            });
        }

        let dims = means[0].len();
        let total: f64 = weights.iter().sum();
        if !(total > 0.0) || weights.iter().any(|w| *w < 0.0 || !w.is_finite()) {
            return Err(AvatarError::InvalidState(
                "mixture weights must be nonnegative with positive sum".to_string(),
            ));
        }
        let weights: Vec<f64> = weights.iter().map(|w| w / total).collect();

        let mut components = Vec::with_capacity(n_comps);
        for (k, (mean, cov)) in means.into_iter().zip(covariances).enumerate() {
            if mean.len() != dims {
                return Err(AvatarError::DimensionMismatch {
                    what: "mixture mean",
                    expected: dims,
                    actual: mean.len(),
                });
            }
            if cov.nrows() != dims || cov.ncols() != dims {
                return Err(AvatarError::DimensionMismatch {
                    what: "mixture covariance",
                    expected: dims,
                    actual: cov.nrows().max(cov.ncols()),
                });
            }
            let chol = cov
                .cholesky()
                .ok_or_else(|| {
                    AvatarError::InvalidState(format!(
                        "covariance of component {} is not positive definite",
                        k
                    ))
                })?
                .l();
            let chol_inv = chol.clone().try_inverse().ok_or_else(|| {
                AvatarError::InvalidState(format!("covariance of component {} is singular", k))
            })?;

            // ln det(2πΣ) = n·ln(2π) + 2·Σ ln L_ii
            let log_det = dims as f64 * (2.0 * PI).ln()
                + 2.0 * chol.diagonal().iter().map(|d| d.ln()).sum::<f64>();
            let log_norm = weights[k].ln() - 0.5 * log_det;

            components.push(Component {
                mean,
                chol,
                chol_inv,
                log_norm,
                residual_const: -log_norm,
            });
        }

        let min_const = components
            .iter()
            .map(|c| c.residual_const)
            .fold(f64::INFINITY, f64::min);
        for c in &mut components {
            c.residual_const -= min_const;
        }

        let chooser = WeightedIndex::new(&weights)
            .map_err(|e| AvatarError::InvalidState(format!("invalid mixture weights: {}", e)))?;

        Ok(Self {
            dims,
            weights,
            components,
            chooser,
        })
    }

    /// 读取文本格式：`nComps nDims`，权重，均值，协方差
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = read_text(path)?;
        let mut tokens = TokenReader::new(path, &text);

        let n_comps: usize = tokens.next("component count")?;
        let dims: usize = tokens.next("dimension")?;
        // 每个分量：权重、均值、协方差
        let per_comp = dims
            .checked_mul(dims)
            .and_then(|n| n.checked_add(dims))
            .and_then(|n| n.checked_add(1))
            .ok_or_else(|| tokens.error(format!("dimension {} too large", dims)))?;
        tokens.ensure_tokens("component count", n_comps, per_comp)?;

        let mut weights = Vec::with_capacity(n_comps);
        for _ in 0..n_comps {
            weights.push(tokens.next::<f64>("weight")?);
        }
        let mut means = Vec::with_capacity(n_comps);
        for _ in 0..n_comps {
            let mut mean = DVector::zeros(dims);
            for d in 0..dims {
                mean[d] = tokens.next("mean")?;
            }
            means.push(mean);
        }
        let mut covariances = Vec::with_capacity(n_comps);
        for _ in 0..n_comps {
            let mut cov = DMatrix::zeros(dims, dims);
            for r in 0..dims {
                for c in 0..dims {
                    cov[(r, c)] = tokens.next("covariance")?;
                }
            }
            covariances.push(cov);
        }

        Self::new(weights, means, covariances).map_err(|e| tokens.error(e.to_string()))
    }

    /// 向量维数
    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn num_components(&self) -> usize {
        self.components.len()
    }

    /// 归一化后的分量权重
    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    /// 按权重选择分量，再从该高斯分布中采样
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> DVector<f64> {
        let comp = &self.components[self.chooser.sample(rng)];
        let z = DVector::from_fn(self.dims, |_, _| rng.sample::<f64, _>(StandardNormal));
        &comp.mean + &comp.chol * z
    }

    /// 概率密度
    pub fn pdf(&self, x: &DVector<f64>) -> f64 {
        self.components
            .iter()
            .map(|c| {
                let maha = (&c.chol_inv * (x - &c.mean)).norm_squared();
                (c.log_norm - 0.5 * maha).exp()
            })
            .sum()
    }

    /// 残差向量（dims + 1 维），其平方范数为负对数似然（相差一个常数）
    ///
    /// 选取使 ½‖L⁻¹(x-μ)‖² + c 最小的分量。
    pub fn residual(&self, x: &DVector<f64>) -> DVector<f64> {
        let mut best: Option<(f64, DVector<f64>, f64)> = None;
        for c in &self.components {
            let white = &c.chol_inv * (x - &c.mean);
            let cost = 0.5 * white.norm_squared() + c.residual_const;
            if best.as_ref().map_or(true, |(b, _, _)| cost < *b) {
                best = Some((cost, white, c.residual_const));
            }
        }

        let mut res = DVector::zeros(self.dims + 1);
        if let Some((_, white, constant)) = best {
            res.rows_mut(0, self.dims)
                .copy_from(&(white * std::f64::consts::FRAC_1_SQRT_2));
            res[self.dims] = constant.sqrt();
        }
        res
    }
}
