//! 连接描述符
//!
//! 描述符是传给 `listen`/`connect` 的文本地址：
//!
//! ```text
//! [(system)]kind:address[:aux[,aux...]]
//! ```
//!
//! 每个附加参数是 `key=value` 或按位置的裸值，参数之间可用 `:` 或 `,` 分隔。
//! 地址可以是带方括号的 IPv6 字面量（`[::1]`）。

use std::fmt;
use std::str::FromStr;

use crate::error::TransportError;

/// 单个附加参数
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AuxParam {
    Positional(String),
    Keyed { key: String, value: String },
}

impl AuxParam {
    pub fn key(&self) -> Option<&str> {
        match self {
            AuxParam::Keyed { key, .. } => Some(key),
            AuxParam::Positional(_) => None,
        }
    }

    pub fn value(&self) -> &str {
        match self {
            AuxParam::Keyed { value, .. } => value,
            AuxParam::Positional(value) => value,
        }
    }
}

impl fmt::Display for AuxParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuxParam::Keyed { key, value } => write!(f, "{}={}", key, value),
            AuxParam::Positional(value) => f.write_str(value),
        }
    }
}

/// 解析后的连接描述符
///
/// 构建后不可变，由 [`ConnectionDescriptor::parse`] 或
/// [`ConnectionDescriptor::builder`] 创建。用 `Display` 格式化后再解析，
/// 得到相等的描述符。
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionDescriptor {
    system: Option<String>,
    kind: String,
    address: String,
    aux: Vec<AuxParam>,
}

impl ConnectionDescriptor {
    pub fn parse(input: &str) -> Result<Self, TransportError> {
        let malformed = |reason: &str| TransportError::descriptor_error(input, reason);

        let (system, rest) = match input.strip_prefix('(') {
            Some(stripped) => {
                let close = stripped
                    .find(')')
                    .ok_or_else(|| malformed("unterminated system prefix"))?;
                let system = &stripped[..close];
                if system.is_empty() {
                    return Err(malformed("empty system name"));
                }
                (Some(system.to_string()), &stripped[close + 1..])
            }
            None => (None, input),
        };

        let (kind, rest) = rest
            .split_once(':')
            .ok_or_else(|| malformed("missing address"))?;
        if kind.is_empty() {
            return Err(malformed("missing kind"));
        }
        if !is_token(kind) {
            return Err(malformed("invalid character in kind"));
        }

        let (address, aux) = if rest.starts_with('[') {
            let close = rest
                .find(']')
                .ok_or_else(|| malformed("unterminated IPv6 address"))?;
            let (address, tail) = rest.split_at(close + 1);
            match tail {
                "" => (address, None),
                _ => match tail.strip_prefix(':') {
                    Some(aux) => (address, Some(aux)),
                    None => return Err(malformed("unexpected text after IPv6 address")),
                },
            }
        } else {
            match rest.split_once(':') {
                Some((address, aux)) => (address, Some(aux)),
                None => (rest, None),
            }
        };
        if address.is_empty() {
            return Err(malformed("missing address"));
        }

        let mut params = Vec::new();
        if let Some(aux) = aux {
            for token in aux.split([':', ',']) {
                params.push(parse_aux(token).map_err(|reason| malformed(reason))?);
            }
        }

        Ok(Self {
            system,
            kind: kind.to_string(),
            address: address.to_string(),
            aux: params,
        })
    }

    pub fn builder(kind: impl Into<String>, address: impl Into<String>) -> DescriptorBuilder {
        DescriptorBuilder {
            system: None,
            kind: kind.into(),
            address: address.into(),
            aux: Vec::new(),
        }
    }

    pub fn system(&self) -> Option<&str> {
        self.system.as_deref()
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// 去掉 IPv6 方括号的地址
    pub fn host(&self) -> &str {
        self.address
            .strip_prefix('[')
            .and_then(|a| a.strip_suffix(']'))
            .unwrap_or(&self.address)
    }

    pub fn aux_params(&self) -> &[AuxParam] {
        &self.aux
    }

    /// 键为 `key` 的参数值
    pub fn aux(&self, key: &str) -> Option<&str> {
        self.aux
            .iter()
            .find(|p| p.key() == Some(key))
            .map(AuxParam::value)
    }

    /// 第 `index` 个位置参数的值
    pub fn aux_at(&self, index: usize) -> Option<&str> {
        self.aux
            .iter()
            .filter(|p| p.key().is_none())
            .nth(index)
            .map(AuxParam::value)
    }

    /// 先按键查找，找不到再取第 `index` 个位置参数
    pub fn aux_with_index_fallback(&self, key: &str, index: usize) -> Option<&str> {
        self.aux(key).or_else(|| self.aux_at(index))
    }

    /// 同上，并解析为 `T`。参数不存在时为 `None`，
    /// 存在但无法解析时为 `Err`
    pub fn aux_parsed<T: FromStr>(&self, key: &str, index: usize) -> Option<Result<T, TransportError>> {
        self.aux_with_index_fallback(key, index).map(|raw| {
            raw.parse::<T>().map_err(|_| {
                TransportError::descriptor_error(self.to_string(), format!("invalid value for '{}': {}", key, raw))
            })
        })
    }

    /// `port` 参数（键值，或第一个位置参数）
    pub fn port(&self) -> Option<Result<u16, TransportError>> {
        self.aux_parsed("port", 0)
    }

    /// 绑定到 `system` 的副本
    pub fn with_system(&self, system: impl Into<String>) -> Self {
        Self {
            system: Some(system.into()),
            ..self.clone()
        }
    }
}

impl fmt::Display for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(system) = &self.system {
            write!(f, "({})", system)?;
        }
        write!(f, "{}:{}", self.kind, self.address)?;
        for (i, param) in self.aux.iter().enumerate() {
            f.write_str(if i == 0 { ":" } else { "," })?;
            write!(f, "{}", param)?;
        }
        Ok(())
    }
}

impl FromStr for ConnectionDescriptor {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// 不经文本解析、直接构建描述符并校验
#[derive(Debug, Clone)]
pub struct DescriptorBuilder {
    system: Option<String>,
    kind: String,
    address: String,
    aux: Vec<AuxParam>,
}

impl DescriptorBuilder {
    pub fn system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.aux.push(AuxParam::Keyed {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    pub fn positional(mut self, value: impl Into<String>) -> Self {
        self.aux.push(AuxParam::Positional(value.into()));
        self
    }

    pub fn build(self) -> Result<ConnectionDescriptor, TransportError> {
        let descriptor = ConnectionDescriptor {
            system: self.system,
            kind: self.kind,
            address: self.address,
            aux: self.aux,
        };
        let invalid = |reason: &str| TransportError::descriptor_error(descriptor.to_string(), reason);

        if let Some(system) = &descriptor.system {
            if system.is_empty() || system.contains([')', '(']) {
                return Err(invalid("invalid system name"));
            }
        }
        if descriptor.kind.is_empty() || !is_token(&descriptor.kind) {
            return Err(invalid("invalid kind"));
        }
        let bracketed = descriptor.address.starts_with('[') && descriptor.address.ends_with(']');
        if descriptor.address.is_empty()
            || (!bracketed && descriptor.address.contains([':', ',', '[']))
            || (bracketed && descriptor.address[1..descriptor.address.len() - 1].contains([']', '[']))
        {
            return Err(invalid("invalid address"));
        }
        for param in &descriptor.aux {
            let ok = match param {
                AuxParam::Keyed { key, value } => is_token(key) && !key.is_empty() && is_value(value),
                AuxParam::Positional(value) => !value.is_empty() && is_value(value),
            };
            if !ok {
                return Err(invalid("invalid aux parameter"));
            }
        }
        Ok(descriptor)
    }
}

fn parse_aux(token: &str) -> Result<AuxParam, &'static str> {
    if token.is_empty() {
        return Err("empty aux parameter");
    }
    match token.split_once('=') {
        Some(("", _)) => Err("aux parameter without key"),
        Some((_, value)) if value.contains('=') => Err("aux parameter with repeated '='"),
        Some((key, value)) => Ok(AuxParam::Keyed {
            key: key.to_string(),
            value: value.to_string(),
        }),
        None => Ok(AuxParam::Positional(token.to_string())),
    }
}

fn is_token(s: &str) -> bool {
    !s.contains([':', ',', '=', '(', ')', '[', ']'])
}

fn is_value(s: &str) -> bool {
    !s.contains([':', ',', '='])
}
