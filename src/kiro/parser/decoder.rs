//! AWS Event Stream 二进制帧解码器
//!
//! 增量式解码：`feed` 喂入任意切分的字节块，`decode_iter` 取出所有
//! 已完整到达的帧。消息布局：
//!
//! 1. Prelude（12 字节）：总长度 u32 BE + 头部长度 u32 BE + prelude CRC
//! 2. 头部块：若干条（1 字节名长、名字、1 字节值类型、值）
//! 3. 载荷：UTF-8 JSON
//! 4. 尾部 4 字节：整条消息的 CRC
//!
//! CRC 均做校验并在不匹配时告警；只要长度字段仍然自洽就继续解码，
//! 长度也对不上时视为流已失步，返回致命错误。

use bytes::{Buf, Bytes, BytesMut};

use crate::error::{Error, Result};

/// Prelude 长度
const PRELUDE_LEN: usize = 12;

/// 最小合法消息长度（prelude + 尾部 CRC）
const MIN_MESSAGE_LEN: usize = 16;

/// 头部值
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    BoolTrue,
    BoolFalse,
    Byte(u8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    ByteArray(Bytes),
    String(String),
    Timestamp(i64),
    Uuid([u8; 16]),
}

/// 单条消息头
#[derive(Debug, Clone, PartialEq)]
pub struct Header {
    pub name: String,
    pub value: HeaderValue,
}

/// 一帧解码结果：已解析的头部 + 原始载荷
#[derive(Debug, Clone)]
pub struct Frame {
    pub headers: Vec<Header>,
    pub payload: Bytes,
}

impl Frame {
    /// 取 `:event-type` 头的字符串值
    pub fn event_type(&self) -> Option<&str> {
        self.headers.iter().find_map(|h| {
            if h.name != ":event-type" {
                return None;
            }
            match &h.value {
                HeaderValue::String(s) => Some(s.as_str()),
                _ => None,
            }
        })
    }
}

/// 事件流解码器
#[derive(Debug, Default)]
pub struct EventStreamDecoder {
    buf: BytesMut,
    frames_decoded: u64,
    /// 流已失步，后续数据不再解码
    failed: bool,
}

impl EventStreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// 喂入一块数据（任意切分均可）
    pub fn feed(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// 已成功解码的帧数
    pub fn frames_decoded(&self) -> u64 {
        self.frames_decoded
    }

    /// 缓冲区里是否还留着未完成的半条消息
    ///
    /// 流正常结束时应为 false；为 true 说明上游在消息中途断开。
    pub fn is_mid_message(&self) -> bool {
        !self.buf.is_empty()
    }

    /// 迭代取出所有已完整到达的帧
    pub fn decode_iter(&mut self) -> DecodeIter<'_> {
        DecodeIter { decoder: self }
    }

    fn decode_next(&mut self) -> Option<Result<Frame>> {
        loop {
            if self.failed || self.buf.len() < PRELUDE_LEN {
                return None;
            }

            let total = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]])
                as usize;
            let headers_len =
                u32::from_be_bytes([self.buf[4], self.buf[5], self.buf[6], self.buf[7]]) as usize;
            let prelude_crc =
                u32::from_be_bytes([self.buf[8], self.buf[9], self.buf[10], self.buf[11]]);

            let lengths_ok = total >= MIN_MESSAGE_LEN && headers_len <= total - MIN_MESSAGE_LEN;

            if crc32fast::hash(&self.buf[..8]) != prelude_crc {
                tracing::warn!(
                    total,
                    headers_len,
                    "prelude CRC 校验失败{}",
                    if lengths_ok { "，长度字段自洽，继续解码" } else { "" }
                );
                if !lengths_ok {
                    self.failed = true;
                    return Some(Err(Error::Protocol(
                        "prelude CRC 校验失败且长度字段不一致，流已失步".to_string(),
                    )));
                }
            }

            if total < MIN_MESSAGE_LEN {
                // 退化 prelude：跳过 12 字节从下一处重新对齐
                self.buf.advance(PRELUDE_LEN);
                continue;
            }

            if self.buf.len() < total {
                // 等待整条消息到齐
                return None;
            }

            let msg = self.buf.split_to(total);

            let msg_crc = u32::from_be_bytes([
                msg[total - 4],
                msg[total - 3],
                msg[total - 2],
                msg[total - 1],
            ]);
            if crc32fast::hash(&msg[..total - 4]) != msg_crc {
                tracing::warn!(total, "消息 CRC 校验失败，长度自洽，继续解码");
            }

            if headers_len > total - MIN_MESSAGE_LEN {
                // 头部长度越界，整条消息丢弃
                continue;
            }

            let headers = parse_headers(&msg[PRELUDE_LEN..PRELUDE_LEN + headers_len]);
            let payload = msg.freeze().slice(PRELUDE_LEN + headers_len..total - 4);

            self.frames_decoded += 1;
            return Some(Ok(Frame { headers, payload }));
        }
    }
}

/// 帧迭代器
pub struct DecodeIter<'a> {
    decoder: &'a mut EventStreamDecoder,
}

impl Iterator for DecodeIter<'_> {
    type Item = Result<Frame>;

    fn next(&mut self) -> Option<Self::Item> {
        self.decoder.decode_next()
    }
}

/// 解析头部块
///
/// 遇到未知值类型时中止本条消息的头部解析，保留已解析的部分。
fn parse_headers(data: &[u8]) -> Vec<Header> {
    let mut headers = Vec::new();
    let mut offset = 0usize;

    while offset < data.len() {
        let name_len = data[offset] as usize;
        offset += 1;
        if offset + name_len > data.len() {
            break;
        }
        let name = String::from_utf8_lossy(&data[offset..offset + name_len]).into_owned();
        offset += name_len;

        if offset >= data.len() {
            break;
        }
        let value_type = data[offset];
        offset += 1;

        let value = match value_type {
            0 => HeaderValue::BoolTrue,
            1 => HeaderValue::BoolFalse,
            2 => {
                let Some(b) = read_fixed::<1>(data, &mut offset) else {
                    break;
                };
                HeaderValue::Byte(b[0])
            }
            3 => {
                let Some(b) = read_fixed::<2>(data, &mut offset) else {
                    break;
                };
                HeaderValue::Int16(i16::from_be_bytes(b))
            }
            4 => {
                let Some(b) = read_fixed::<4>(data, &mut offset) else {
                    break;
                };
                HeaderValue::Int32(i32::from_be_bytes(b))
            }
            5 => {
                let Some(b) = read_fixed::<8>(data, &mut offset) else {
                    break;
                };
                HeaderValue::Int64(i64::from_be_bytes(b))
            }
            6 => {
                let Some(b) = read_var(data, &mut offset) else {
                    break;
                };
                HeaderValue::ByteArray(Bytes::copy_from_slice(b))
            }
            7 => {
                let Some(b) = read_var(data, &mut offset) else {
                    break;
                };
                HeaderValue::String(String::from_utf8_lossy(b).into_owned())
            }
            8 => {
                let Some(b) = read_fixed::<8>(data, &mut offset) else {
                    break;
                };
                HeaderValue::Timestamp(i64::from_be_bytes(b))
            }
            9 => {
                let Some(b) = read_fixed::<16>(data, &mut offset) else {
                    break;
                };
                HeaderValue::Uuid(b)
            }
            // 未知类型：中止本条消息的头部解析
            _ => break,
        };

        headers.push(Header { name, value });
    }

    headers
}

fn read_fixed<const N: usize>(data: &[u8], offset: &mut usize) -> Option<[u8; N]> {
    if *offset + N > data.len() {
        return None;
    }
    let mut out = [0u8; N];
    out.copy_from_slice(&data[*offset..*offset + N]);
    *offset += N;
    Some(out)
}

fn read_var<'a>(data: &'a [u8], offset: &mut usize) -> Option<&'a [u8]> {
    if *offset + 2 > data.len() {
        return None;
    }
    let len = u16::from_be_bytes([data[*offset], data[*offset + 1]]) as usize;
    *offset += 2;
    if *offset + len > data.len() {
        return None;
    }
    let out = &data[*offset..*offset + len];
    *offset += len;
    Some(out)
}

/// 测试辅助：按线上格式编码一条消息（字符串头 + JSON 载荷，CRC 真实计算）
#[cfg(test)]
pub(crate) fn encode_message(event_type: &str, payload: &str) -> Vec<u8> {
    let mut headers = Vec::new();
    let name = b":event-type";
    headers.push(name.len() as u8);
    headers.extend_from_slice(name);
    headers.push(7u8);
    headers.extend_from_slice(&(event_type.len() as u16).to_be_bytes());
    headers.extend_from_slice(event_type.as_bytes());

    let total = PRELUDE_LEN + headers.len() + payload.len() + 4;

    let mut msg = Vec::with_capacity(total);
    msg.extend_from_slice(&(total as u32).to_be_bytes());
    msg.extend_from_slice(&(headers.len() as u32).to_be_bytes());
    let prelude_crc = crc32fast::hash(&msg);
    msg.extend_from_slice(&prelude_crc.to_be_bytes());
    msg.extend_from_slice(&headers);
    msg.extend_from_slice(payload.as_bytes());
    let msg_crc = crc32fast::hash(&msg);
    msg.extend_from_slice(&msg_crc.to_be_bytes());
    msg
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(decoder: &mut EventStreamDecoder) -> Vec<Frame> {
        decoder
            .decode_iter()
            .map(|r| match r {
                Ok(f) => f,
                Err(e) => panic!("{:?}", e),
            })
            .collect()
    }

    #[test]
    fn test_decode_single_message() {
        let data = encode_message("assistantResponseEvent", r#"{"content":"hi"}"#);
        let mut decoder = EventStreamDecoder::new();
        decoder.feed(&data);

        let frames = drain(&mut decoder);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event_type(), Some("assistantResponseEvent"));
        assert_eq!(frames[0].payload.as_ref(), &br#"{"content":"hi"}"#[..]);
        assert_eq!(decoder.frames_decoded(), 1);
        assert!(!decoder.is_mid_message());
    }

    #[test]
    fn test_decode_is_incremental() {
        // 同一条消息按 1 字节切分喂入，结果与整块喂入一致
        let data = encode_message("metadataEvent", r#"{"tokenUsage":{"outputTokens":5}}"#);
        let mut decoder = EventStreamDecoder::new();

        let mut frames = Vec::new();
        for b in &data {
            decoder.feed(std::slice::from_ref(b));
            frames.extend(drain(&mut decoder));
        }
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event_type(), Some("metadataEvent"));
    }

    #[test]
    fn test_decode_concat_equals_sequential() {
        // 左折叠性质：decode(concat(m1, m2)) == decode(m1) ++ decode(m2)
        let m1 = encode_message("assistantResponseEvent", r#"{"content":"a"}"#);
        let m2 = encode_message("meteringEvent", r#"{"usage":1.5}"#);

        let mut concat_decoder = EventStreamDecoder::new();
        let mut joined = m1.clone();
        joined.extend_from_slice(&m2);
        concat_decoder.feed(&joined);
        let concat_frames = drain(&mut concat_decoder);

        let mut seq_decoder = EventStreamDecoder::new();
        seq_decoder.feed(&m1);
        let mut seq_frames = drain(&mut seq_decoder);
        seq_decoder.feed(&m2);
        seq_frames.extend(drain(&mut seq_decoder));

        assert_eq!(concat_frames.len(), 2);
        assert_eq!(seq_frames.len(), 2);
        for (a, b) in concat_frames.iter().zip(seq_frames.iter()) {
            assert_eq!(a.event_type(), b.event_type());
            assert_eq!(a.payload, b.payload);
        }
    }

    #[test]
    fn test_truncated_message_detected() {
        let data = encode_message("assistantResponseEvent", r#"{"content":"hi"}"#);
        let mut decoder = EventStreamDecoder::new();
        decoder.feed(&data[..data.len() - 3]);

        assert!(drain(&mut decoder).is_empty());
        assert!(decoder.is_mid_message());
    }

    #[test]
    fn test_message_crc_mismatch_is_tolerated() {
        // 尾部 CRC 改坏：长度仍自洽，帧照常产出
        let mut data = encode_message("assistantResponseEvent", r#"{"content":"hi"}"#);
        let n = data.len();
        data[n - 1] ^= 0xff;

        let mut decoder = EventStreamDecoder::new();
        decoder.feed(&data);
        let frames = drain(&mut decoder);
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn test_prelude_crc_mismatch_with_bad_lengths_is_fatal() {
        let mut data = encode_message("assistantResponseEvent", r#"{"content":"hi"}"#);
        // 把总长度字段改成非法值（< 16），prelude CRC 随之失配
        data[0..4].copy_from_slice(&4u32.to_be_bytes());

        let mut decoder = EventStreamDecoder::new();
        decoder.feed(&data);
        let mut iter = decoder.decode_iter();
        match iter.next() {
            Some(Err(Error::Protocol(_))) => {}
            other => panic!("期望 Protocol 错误，得到 {:?}", other),
        }
        // 失步后不再产出
        assert!(iter.next().is_none());
    }

    #[test]
    fn test_oversized_headers_skips_message() {
        let good = encode_message("assistantResponseEvent", r#"{"content":"ok"}"#);

        // 构造头部长度越界、但 prelude CRC 正确的消息
        let mut bad = Vec::new();
        let total = MIN_MESSAGE_LEN + 4;
        bad.extend_from_slice(&(total as u32).to_be_bytes());
        bad.extend_from_slice(&(total as u32).to_be_bytes()); // headers_len > total - 16
        let crc = crc32fast::hash(&bad);
        bad.extend_from_slice(&crc.to_be_bytes());
        bad.resize(total, 0);

        let mut decoder = EventStreamDecoder::new();
        decoder.feed(&bad);
        decoder.feed(&good);
        let frames = drain(&mut decoder);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event_type(), Some("assistantResponseEvent"));
    }

    #[test]
    fn test_unknown_header_type_aborts_header_parse() {
        // 自定义头部块：一条合法字符串头 + 一条未知类型头 + 再一条字符串头
        let mut headers = Vec::new();
        headers.push(3u8);
        headers.extend_from_slice(b"foo");
        headers.push(7u8);
        headers.extend_from_slice(&1u16.to_be_bytes());
        headers.push(b'x');

        headers.push(3u8);
        headers.extend_from_slice(b"bar");
        headers.push(42u8); // 未知类型
        headers.push(0u8);

        headers.push(11u8);
        headers.extend_from_slice(b":event-type");
        headers.push(7u8);
        headers.extend_from_slice(&1u16.to_be_bytes());
        headers.push(b'e');

        let parsed = parse_headers(&headers);
        // 未知类型后面的头全部丢弃
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].name, "foo");
        assert_eq!(parsed[0].value, HeaderValue::String("x".to_string()));
    }

    #[test]
    fn test_parse_headers_all_known_types() {
        let mut data = Vec::new();
        let entries: Vec<(&[u8], u8, Vec<u8>)> = vec![
            (b"t", 0, vec![]),
            (b"f", 1, vec![]),
            (b"b", 2, vec![0x7f]),
            (b"i16", 3, 258i16.to_be_bytes().to_vec()),
            (b"i32", 4, 70000i32.to_be_bytes().to_vec()),
            (b"i64", 5, 1i64.to_be_bytes().to_vec()),
            (b"ts", 8, 1700000000000i64.to_be_bytes().to_vec()),
            (b"id", 9, vec![0u8; 16]),
        ];
        for (name, ty, value) in &entries {
            data.push(name.len() as u8);
            data.extend_from_slice(name);
            data.push(*ty);
            data.extend_from_slice(value);
        }

        let parsed = parse_headers(&data);
        assert_eq!(parsed.len(), entries.len());
        assert_eq!(parsed[0].value, HeaderValue::BoolTrue);
        assert_eq!(parsed[1].value, HeaderValue::BoolFalse);
        assert_eq!(parsed[2].value, HeaderValue::Byte(0x7f));
        assert_eq!(parsed[3].value, HeaderValue::Int16(258));
        assert_eq!(parsed[4].value, HeaderValue::Int32(70000));
        assert_eq!(parsed[5].value, HeaderValue::Int64(1));
        assert_eq!(parsed[6].value, HeaderValue::Timestamp(1700000000000));
        assert_eq!(parsed[7].value, HeaderValue::Uuid([0u8; 16]));
    }
}
