//! 标识生成
//!
//! - 十位 62 进制短 ID：订阅 ID 等运行时内部句柄
//! - UUID v4：事件 ID
//! - [`IdSequence`]：单调递增、永不复用的数值序列（模块 ID）

use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// 62 进制字符集
const BASE62_CHARS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// ID 长度
const ID_LENGTH: usize = 10;

/// 生成 10 位 62 进制 ID
///
/// 使用时间戳与随机数组合。
///
/// # Example
///
/// ```
/// use chips_runtime::utils::id::generate_id;
///
/// let id = generate_id();
/// assert_eq!(id.len(), 10);
/// ```
pub fn generate_id() -> String {
    let mut rng = rand::thread_rng();

    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default();
    let random: u64 = rng.gen();
    let mut value = timestamp ^ random;

    let mut result = String::with_capacity(ID_LENGTH);
    let mut digits = [0u8; ID_LENGTH];
    for slot in digits.iter_mut().rev() {
        *slot = BASE62_CHARS[(value % 62) as usize];
        value /= 62;
    }
    for d in digits {
        result.push(d as char);
    }
    result
}

/// 验证短 ID 格式是否有效
///
/// ```
/// use chips_runtime::utils::id::is_valid_id;
///
/// assert!(is_valid_id("a1B2c3D4e5"));
/// assert!(!is_valid_id("too-short"));
/// ```
pub fn is_valid_id(id: &str) -> bool {
    id.len() == ID_LENGTH && id.chars().all(|c| c.is_ascii_alphanumeric())
}

/// 生成 UUID v4 格式的 ID
pub fn generate_uuid() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// 单调递增的数值序列
///
/// 分配出去的值永不复用；从持久化记录恢复时用 [`IdSequence::resume_after`]
/// 把序列推进到已用最大值之后。
#[derive(Debug)]
pub struct IdSequence {
    next: AtomicU64,
}

impl IdSequence {
    /// 从 `first` 开始的序列
    pub fn starting_at(first: u64) -> Self {
        Self {
            next: AtomicU64::new(first),
        }
    }

    /// 分配下一个值
    pub fn allocate(&self) -> u64 {
        self.next.fetch_add(1, Ordering::SeqCst)
    }

    /// 确保后续分配的值都大于 `used`
    pub fn resume_after(&self, used: u64) {
        self.next.fetch_max(used.saturating_add(1), Ordering::SeqCst);
    }

    /// 下一个将被分配的值（不消耗）
    pub fn peek(&self) -> u64 {
        self.next.load(Ordering::SeqCst)
    }
}
