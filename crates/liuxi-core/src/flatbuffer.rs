//! 解析缓冲区.
//!
//! 追加写入的字节区域, 携带一个读游标和至多一个书签.
//! 推式解析器 (H.264 / MPEG-TS) 把输入字节写进来, 解析函数消费之;
//! 当一次写入放不下时, 调用方通过 `compact` 把未读窗口滑动到起点.
//!
//! 书签以缓冲区内偏移保存 (而非指针), 压缩时随数据一起平移,
//! 因此在压缩之后仍然指向同一个字节. H.264 解析器用书签记住
//! 一个 NAL 单元的起始位置, 同时读游标继续向前扫描其结束位置.

/// 追加写入的解析缓冲区
pub struct FlatBuffer {
    buf: Vec<u8>,
    read: usize,
    write: usize,
    bookmark: Option<usize>,
}

impl FlatBuffer {
    /// 创建指定容量的缓冲区
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity],
            read: 0,
            write: 0,
            bookmark: None,
        }
    }

    /// 缓冲区总容量
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// 未读字节数
    pub fn read_available(&self) -> usize {
        self.write - self.read
    }

    /// 尾部剩余可写字节数
    pub fn write_available(&self) -> usize {
        self.buf.len() - self.write
    }

    /// 追加写入, 返回实际写入的字节数 (受剩余空间限制)
    pub fn write(&mut self, data: &[u8]) -> usize {
        let n = data.len().min(self.write_available());
        self.buf[self.write..self.write + n].copy_from_slice(&data[..n]);
        self.write += n;
        n
    }

    /// 未读窗口
    pub fn read_slice(&self) -> &[u8] {
        &self.buf[self.read..self.write]
    }

    /// 消费 n 个未读字节 (读游标前移)
    pub fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.read_available());
        self.read = (self.read + n).min(self.write);
    }

    /// 在当前读游标处设置书签
    pub fn set_bookmark(&mut self) {
        self.bookmark = Some(self.read);
    }

    /// 书签位置 (缓冲区内偏移)
    pub fn bookmark(&self) -> Option<usize> {
        self.bookmark
    }

    /// 清除书签
    pub fn clear_bookmark(&mut self) {
        self.bookmark = None;
    }

    /// 从书签到当前读游标之间的字节
    pub fn bookmark_to_read(&self) -> Option<&[u8]> {
        self.bookmark.map(|b| &self.buf[b..self.read])
    }

    /// 把保留窗口滑动到缓冲区起点, 腾出尾部写入空间
    ///
    /// 保留窗口从书签 (若有) 或读游标开始, 到写游标结束.
    /// 书签、读写游标同步平移, 仍指向原来的字节.
    pub fn compact(&mut self) {
        let origin = self.bookmark.unwrap_or(self.read).min(self.read);
        if origin == 0 {
            return;
        }
        self.buf.copy_within(origin..self.write, 0);
        self.read -= origin;
        self.write -= origin;
        if let Some(b) = self.bookmark.as_mut() {
            *b -= origin;
        }
    }

    /// 清空缓冲区与书签
    pub fn reset(&mut self) {
        self.read = 0;
        self.write = 0;
        self.bookmark = None;
    }
}

impl std::fmt::Debug for FlatBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlatBuffer")
            .field("capacity", &self.buf.len())
            .field("read", &self.read)
            .field("write", &self.write)
            .field("bookmark", &self.bookmark)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_and_consume() {
        let mut fb = FlatBuffer::with_capacity(8);
        assert_eq!(fb.write(&[1, 2, 3, 4, 5]), 5);
        assert_eq!(fb.read_available(), 5);
        assert_eq!(fb.read_slice(), &[1, 2, 3, 4, 5]);

        fb.consume(2);
        assert_eq!(fb.read_slice(), &[3, 4, 5]);
        assert_eq!(fb.write(&[6, 7, 8, 9]), 3, "写入受容量限制");
    }

    #[test]
    fn test_compact_slides_unread_window() {
        let mut fb = FlatBuffer::with_capacity(8);
        fb.write(&[1, 2, 3, 4, 5, 6, 7, 8]);
        fb.consume(6);
        assert_eq!(fb.write_available(), 0);

        fb.compact();
        assert_eq!(fb.read_slice(), &[7, 8]);
        assert_eq!(fb.write_available(), 6);
        assert_eq!(fb.write(&[9, 10]), 2);
        assert_eq!(fb.read_slice(), &[7, 8, 9, 10]);
    }

    #[test]
    fn test_bookmark_survives_compact() {
        let mut fb = FlatBuffer::with_capacity(8);
        fb.write(&[0, 0, 1, 0x67, 0xAA, 0xBB, 0xCC, 0xDD]);
        fb.consume(3);
        fb.set_bookmark();
        // 继续扫描, 读游标越过书签
        fb.consume(4);

        fb.compact();
        let marked = fb.bookmark().expect("书签应在压缩后保留");
        assert_eq!(fb.bookmark_to_read().unwrap()[0], 0x67);
        assert_eq!(marked, 0);

        // 压缩腾出的空间可继续写入
        assert!(fb.write_available() >= 3);
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut fb = FlatBuffer::with_capacity(4);
        fb.write(&[1, 2, 3]);
        fb.consume(1);
        fb.set_bookmark();
        fb.reset();
        assert_eq!(fb.read_available(), 0);
        assert_eq!(fb.write_available(), 4);
        assert!(fb.bookmark().is_none());
    }
}
