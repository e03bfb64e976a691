//! 输出设备选择
//!
//! 纯函数：给定设备列表、平台默认设备和用户偏好名称，返回要打开的设备。
//! 每次打开流时重新查询设备列表，这里不缓存任何状态。

/// 输出设备描述
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// 后端内的设备序号
    pub index: usize,
    /// 设备名称
    pub name: String,
    /// 最大输出声道数（0 表示纯输入设备）
    pub max_output_channels: u16,
}

impl DeviceInfo {
    pub fn new(index: usize, name: impl Into<String>, max_output_channels: u16) -> Self {
        Self {
            index,
            name: name.into(),
            max_output_channels,
        }
    }

    #[inline]
    pub fn has_output(&self) -> bool {
        self.max_output_channels > 0
    }
}

impl std::fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}] {} ({} ch)",
            self.index, self.name, self.max_output_channels
        )
    }
}

/// 选择输出设备
///
/// 优先级（都只考虑有输出声道的设备）：
/// 1. 名称与 `preferred` 完全相同（区分大小写）
/// 2. 名称以 `preferred` 开头（不区分大小写）
/// 3. 平台默认设备
/// 4. 第一个可用设备
///
/// 返回 `DeviceInfo::index`，没有可用设备时返回 `None`。
pub fn select_device(
    devices: &[DeviceInfo],
    default_index: Option<usize>,
    preferred: Option<&str>,
) -> Option<usize> {
    let outputs = || devices.iter().filter(|d| d.has_output());

    if let Some(hint) = preferred.filter(|h| !h.is_empty()) {
        if let Some(d) = outputs().find(|d| d.name == hint) {
            return Some(d.index);
        }
        if let Some(d) = outputs().find(|d| starts_with_ignore_case(&d.name, hint)) {
            return Some(d.index);
        }
    }

    if let Some(default_index) = default_index {
        if outputs().any(|d| d.index == default_index) {
            return Some(default_index);
        }
    }

    outputs().next().map(|d| d.index)
}

fn starts_with_ignore_case(name: &str, prefix: &str) -> bool {
    name.len() >= prefix.len()
        && name.as_bytes()[..prefix.len()].eq_ignore_ascii_case(prefix.as_bytes())
}
