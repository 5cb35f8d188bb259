//! 空白分隔的文本记号读取器

use std::fmt::Display;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::{AvatarError, Result};

/// 逐个读取文本文件中的记号，出错时附带文件路径
pub(crate) struct TokenReader<'a> {
    path: &'a Path,
    rest: &'a str,
}

impl<'a> TokenReader<'a> {
    pub fn new(path: &'a Path, text: &'a str) -> Self {
        Self {
            path,
            rest: text,
        }
    }

    /// 读取下一个记号；文件提前结束或格式错误都会返回 `AssetLoad`
    pub fn next<T>(&mut self, what: &str) -> Result<T>
    where
        T: FromStr,
        T::Err: Display,
    {
        let tok = self
            .next_str()
            .ok_or_else(|| self.error(format!("unexpected EOF while reading {}", what)))?;
        tok.parse::<T>()
            .map_err(|e| self.error(format!("invalid {} '{}': {}", what, tok, e)))
    }

    pub fn next_str(&mut self) -> Option<&'a str> {
        let rest = self.rest.trim_start();
        if rest.is_empty() {
            self.rest = rest;
            return None;
        }
        let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
        let (tok, tail) = rest.split_at(end);
        self.rest = tail;
        Some(tok)
    }

    /// 读取元素个数，并确认剩余内容放得下 `count * per_item` 个记号，
    /// 之后按该个数预分配不会越界
    pub fn count(&mut self, what: &str, per_item: usize) -> Result<usize> {
        let n: usize = self.next(what)?;
        self.ensure_tokens(what, n, per_item)?;
        Ok(n)
    }

    pub fn ensure_tokens(&self, what: &str, count: usize, per_item: usize) -> Result<()> {
        let available = self.max_remaining();
        match count.checked_mul(per_item) {
            Some(needed) if needed <= available => Ok(()),
            _ => Err(self.error(format!(
                "{} {} exceeds what the remaining {} bytes can hold",
                what,
                count,
                self.rest.len()
            ))),
        }
    }

    /// 剩余记号数的上界：记号至少一个字符，相邻记号之间至少一个空白
    fn max_remaining(&self) -> usize {
        (self.rest.len() + 1) / 2
    }

    pub fn error(&self, reason: impl Into<String>) -> AvatarError {
        AvatarError::asset(self.path, reason)
    }
}

/// 读取整个文本文件
pub(crate) fn read_text(path: &Path) -> Result<String> {
    fs::read_to_string(path).map_err(|e| AvatarError::asset(path, format!("cannot read file: {}", e)))
}

/// 可选资源：文件不存在时返回 `None`
pub(crate) fn read_optional_text(path: &Path) -> Result<Option<(PathBuf, String)>> {
    if !path.is_file() {
        return Ok(None);
    }
    read_text(path).map(|text| Some((path.to_path_buf(), text)))
}
