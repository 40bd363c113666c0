use glam::Vec3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MessageError {
    #[error("write overflows message capacity")]
    Overflow,
    #[error("read past the end of message data")]
    OutOfData,
}

/// Saved write cursor, used to patch a placeholder field after the fact.
#[derive(Debug, Clone, Copy)]
pub struct WriteState {
    size: usize,
    bit: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct ReadState {
    count: usize,
    bit: u32,
}

/// A packet payload buffer written and read at bit granularity. The write
/// and read cursors are independent; an overflowing write resets the write
/// cursor and latches a sticky flag rather than leaving a partial value in
/// the buffer.
#[derive(Debug, Clone)]
pub struct BitMessage {
    data: Vec<u8>,
    max_size: usize,
    cur_size: usize,
    write_bit: u32,
    read_count: usize,
    read_bit: u32,
    overflowed: bool,
}

impl BitMessage {
    pub fn with_capacity(bytes: usize) -> Self {
        assert!(bytes > 0, "message capacity must be non-zero");
        Self {
            data: vec![0; bytes],
            max_size: bytes,
            cur_size: 0,
            write_bit: 0,
            read_count: 0,
            read_bit: 0,
            overflowed: false,
        }
    }

    /// A message holding a copy of `data`, primed for reading.
    pub fn from_bytes(data: &[u8]) -> Self {
        let mut msg = Self::with_capacity(data.len().max(1));
        msg.data[..data.len()].copy_from_slice(data);
        msg.cur_size = data.len();
        msg
    }

    pub fn begin_writing(&mut self) {
        self.cur_size = 0;
        self.write_bit = 0;
        self.overflowed = false;
    }

    pub fn begin_reading(&mut self) {
        self.read_count = 0;
        self.read_bit = 0;
    }

    /// Bytes written so far.
    pub fn len(&self) -> usize {
        self.cur_size
    }

    pub fn is_empty(&self) -> bool {
        self.cur_size == 0
    }

    pub fn capacity(&self) -> usize {
        self.max_size
    }

    pub fn is_overflowed(&self) -> bool {
        self.overflowed
    }

    /// The written portion of the buffer.
    pub fn data(&self) -> &[u8] {
        &self.data[..self.cur_size]
    }

    pub fn num_bits_written(&self) -> usize {
        (self.cur_size << 3) - ((8 - self.write_bit as usize) & 7)
    }

    pub fn remaining_write_bits(&self) -> usize {
        (self.max_size << 3) - self.num_bits_written()
    }

    /// Bytes consumed by the read cursor.
    pub fn read_count(&self) -> usize {
        self.read_count
    }

    pub fn num_bits_read(&self) -> usize {
        (self.read_count << 3) - ((8 - self.read_bit as usize) & 7)
    }

    pub fn remaining_read_bits(&self) -> usize {
        (self.cur_size << 3) - self.num_bits_read()
    }

    pub fn save_write_state(&self) -> WriteState {
        WriteState {
            size: self.cur_size,
            bit: self.write_bit,
        }
    }

    pub fn restore_write_state(&mut self, state: WriteState) {
        self.cur_size = state.size;
        self.write_bit = state.bit & 7;
        if self.write_bit != 0 {
            self.data[self.cur_size - 1] &= (1 << self.write_bit) - 1;
        }
    }

    pub fn save_read_state(&self) -> ReadState {
        ReadState {
            count: self.read_count,
            bit: self.read_bit,
        }
    }

    pub fn restore_read_state(&mut self, state: ReadState) {
        self.read_count = state.count;
        self.read_bit = state.bit & 7;
    }

    pub fn write_byte_align(&mut self) {
        self.write_bit = 0;
    }

    pub fn read_byte_align(&mut self) {
        self.read_bit = 0;
    }

    fn check_overflow(&mut self, num_bits: usize) -> Result<(), MessageError> {
        if num_bits > self.remaining_write_bits() {
            self.begin_writing();
            self.overflowed = true;
            return Err(MessageError::Overflow);
        }
        Ok(())
    }

    fn byte_space(&mut self, len: usize) -> Result<&mut [u8], MessageError> {
        self.write_byte_align();
        self.check_overflow(len << 3)?;
        let start = self.cur_size;
        self.cur_size += len;
        Ok(&mut self.data[start..start + len])
    }

    /// Writes the low `|num_bits|` bits of `value`; a negative `num_bits`
    /// treats the field as signed. A value that does not fit the field is a
    /// caller bug, not a runtime condition.
    pub fn write_bits(&mut self, value: i32, num_bits: i32) -> Result<(), MessageError> {
        assert!(
            num_bits != 0 && (-31..=32).contains(&num_bits),
            "bad bit width {num_bits}"
        );

        if num_bits != 32 {
            if num_bits > 0 {
                let max = (1i64 << num_bits) - 1;
                assert!(
                    value as i64 <= max && value >= 0,
                    "value {value} out of range for {num_bits} unsigned bits"
                );
            } else {
                let r = 1i64 << (-1 - num_bits);
                assert!(
                    (value as i64) < r && value as i64 >= -r,
                    "value {value} out of range for {} signed bits",
                    -num_bits
                );
            }
        }

        let mut num_bits = num_bits.unsigned_abs();
        self.check_overflow(num_bits as usize)?;

        let mut value = value as u32;
        while num_bits > 0 {
            if self.write_bit == 0 {
                self.data[self.cur_size] = 0;
                self.cur_size += 1;
            }

            let put = (8 - self.write_bit).min(num_bits);
            let fraction = value & ((1 << put) - 1);
            self.data[self.cur_size - 1] |= (fraction << self.write_bit) as u8;
            num_bits -= put;
            value >>= put;
            self.write_bit = (self.write_bit + put) & 7;
        }
        Ok(())
    }

    pub fn write_i8(&mut self, v: i8) -> Result<(), MessageError> {
        self.write_bits(v as i32, -8)
    }

    pub fn write_u8(&mut self, v: u8) -> Result<(), MessageError> {
        self.write_bits(v as i32, 8)
    }

    pub fn write_i16(&mut self, v: i16) -> Result<(), MessageError> {
        self.write_bits(v as i32, -16)
    }

    pub fn write_u16(&mut self, v: u16) -> Result<(), MessageError> {
        self.write_bits(v as i32, 16)
    }

    pub fn write_i32(&mut self, v: i32) -> Result<(), MessageError> {
        self.write_bits(v, 32)
    }

    pub fn write_f32(&mut self, v: f32) -> Result<(), MessageError> {
        self.write_bits(v.to_bits() as i32, 32)
    }

    pub fn write_vec3(&mut self, v: Vec3) -> Result<(), MessageError> {
        self.write_f32(v.x)?;
        self.write_f32(v.y)?;
        self.write_f32(v.z)
    }

    /// Byte-aligned copy of `s` truncated to `max_len - 1` bytes plus a NUL
    /// terminator. With `make_7bit`, bytes above 127 become `.`.
    pub fn write_string(
        &mut self,
        s: &str,
        max_len: usize,
        make_7bit: bool,
    ) -> Result<(), MessageError> {
        let bytes = s.as_bytes();
        let len = bytes.len().min(max_len.saturating_sub(1));
        let span = self.byte_space(len + 1)?;
        for (dst, &b) in span[..len].iter_mut().zip(bytes) {
            *dst = if make_7bit && b > 127 { b'.' } else { b };
        }
        span[len] = 0;
        Ok(())
    }

    /// Byte-aligned raw copy.
    pub fn write_data(&mut self, data: &[u8]) -> Result<(), MessageError> {
        self.byte_space(data.len())?.copy_from_slice(data);
        Ok(())
    }

    /// Reads `|num_bits|` bits, sign-extending when `num_bits` is negative.
    pub fn read_bits(&mut self, num_bits: i32) -> Result<i32, MessageError> {
        assert!(
            num_bits != 0 && (-31..=32).contains(&num_bits),
            "bad bit width {num_bits}"
        );

        let signed = num_bits < 0;
        let num_bits = num_bits.unsigned_abs();

        if num_bits as usize > self.remaining_read_bits() {
            return Err(MessageError::OutOfData);
        }

        let mut value: u32 = 0;
        let mut value_bits: u32 = 0;
        while value_bits < num_bits {
            if self.read_bit == 0 {
                self.read_count += 1;
            }

            let get = (8 - self.read_bit).min(num_bits - value_bits);
            let fraction = (self.data[self.read_count - 1] as u32 >> self.read_bit) & ((1 << get) - 1);
            value |= fraction << value_bits;

            value_bits += get;
            self.read_bit = (self.read_bit + get) & 7;
        }

        if signed && num_bits < 32 && value & (1 << (num_bits - 1)) != 0 {
            value |= !0u32 << num_bits;
        }

        Ok(value as i32)
    }

    pub fn read_i8(&mut self) -> Result<i8, MessageError> {
        Ok(self.read_bits(-8)? as i8)
    }

    pub fn read_u8(&mut self) -> Result<u8, MessageError> {
        Ok(self.read_bits(8)? as u8)
    }

    pub fn read_i16(&mut self) -> Result<i16, MessageError> {
        Ok(self.read_bits(-16)? as i16)
    }

    pub fn read_u16(&mut self) -> Result<u16, MessageError> {
        Ok(self.read_bits(16)? as u16)
    }

    pub fn read_i32(&mut self) -> Result<i32, MessageError> {
        self.read_bits(32)
    }

    pub fn read_f32(&mut self) -> Result<f32, MessageError> {
        Ok(f32::from_bits(self.read_bits(32)? as u32))
    }

    pub fn read_vec3(&mut self) -> Result<Vec3, MessageError> {
        Ok(Vec3::new(self.read_f32()?, self.read_f32()?, self.read_f32()?))
    }

    /// Reads up to `max_len - 1` bytes, stopping at the NUL terminator or
    /// the end of data. Format specifiers are defanged to `.` so the result
    /// is safe to hand to string routines.
    pub fn read_string(&mut self, max_len: usize) -> String {
        self.read_byte_align();
        let mut out = Vec::new();
        loop {
            let c = match self.read_bits(8) {
                Ok(c) => c,
                Err(_) => break,
            };
            if c <= 0 || c >= 255 {
                break;
            }
            let b = if c as u8 == b'%' { b'.' } else { c as u8 };
            if out.len() < max_len.saturating_sub(1) {
                out.push(b);
            }
        }
        String::from_utf8_lossy(&out).into_owned()
    }

    /// Byte-aligned copy into `out`, truncated at the end of written data.
    /// Returns the number of bytes copied.
    pub fn read_data(&mut self, out: &mut [u8]) -> usize {
        self.read_byte_align();
        let available = self.cur_size - self.read_count;
        let count = out.len().min(available);
        out[..count].copy_from_slice(&self.data[self.read_count..self.read_count + count]);
        self.read_count += count;
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsigned_round_trip_all_widths() {
        let mut msg = BitMessage::with_capacity(64);
        for width in 1..=31i32 {
            let max = (1u32 << width) - 1;
            for value in [0u32, 1, max / 2, max] {
                msg.begin_writing();
                msg.write_bits(value as i32, width).unwrap();
                msg.begin_reading();
                assert_eq!(msg.read_bits(width).unwrap() as u32, value, "width {width}");
            }
        }
    }

    #[test]
    fn test_signed_round_trip_all_widths() {
        let mut msg = BitMessage::with_capacity(64);
        for width in 2..=31i32 {
            let r = 1i32 << (width - 1);
            for value in [-r, -1, 0, 1, r - 1] {
                msg.begin_writing();
                msg.write_bits(value, -width).unwrap();
                msg.begin_reading();
                assert_eq!(msg.read_bits(-width).unwrap(), value, "width {width}");
            }
        }
    }

    #[test]
    fn test_mixed_fields_round_trip() {
        let mut msg = BitMessage::with_capacity(256);
        msg.write_bits(5, 3).unwrap();
        msg.write_u8(200).unwrap();
        msg.write_i16(-12345).unwrap();
        msg.write_bits(-2, -4).unwrap();
        msg.write_i32(i32::MIN).unwrap();
        msg.write_u16(54321).unwrap();

        msg.begin_reading();
        assert_eq!(msg.read_bits(3).unwrap(), 5);
        assert_eq!(msg.read_u8().unwrap(), 200);
        assert_eq!(msg.read_i16().unwrap(), -12345);
        assert_eq!(msg.read_bits(-4).unwrap(), -2);
        assert_eq!(msg.read_i32().unwrap(), i32::MIN);
        assert_eq!(msg.read_u16().unwrap(), 54321);
    }

    #[test]
    fn test_f32_and_vec3_round_trip() {
        let mut msg = BitMessage::with_capacity(64);
        msg.write_f32(3.75).unwrap();
        msg.write_vec3(Vec3::new(1.0, -2.5, 1e-6)).unwrap();

        msg.begin_reading();
        assert_eq!(msg.read_f32().unwrap(), 3.75);
        assert_eq!(msg.read_vec3().unwrap(), Vec3::new(1.0, -2.5, 1e-6));
    }

    #[test]
    fn test_string_round_trip() {
        let mut msg = BitMessage::with_capacity(64);
        msg.write_string("hello", 32, false).unwrap();

        msg.begin_reading();
        assert_eq!(msg.read_string(32), "hello");
    }

    #[test]
    fn test_string_truncation() {
        let mut msg = BitMessage::with_capacity(64);
        msg.write_string("abcdefgh", 4, false).unwrap();

        msg.begin_reading();
        assert_eq!(msg.read_string(32), "abc");
    }

    #[test]
    fn test_string_7bit_sanitization() {
        let mut msg = BitMessage::with_capacity(64);
        // "é" encodes as two bytes above 127
        msg.write_string("a\u{00e9}b", 32, true).unwrap();

        msg.begin_reading();
        assert_eq!(msg.read_string(32), "a..b");
    }

    #[test]
    fn test_overflow_resets_and_latches() {
        let mut msg = BitMessage::with_capacity(2);
        msg.write_u8(1).unwrap();
        assert_eq!(msg.write_i32(42), Err(MessageError::Overflow));
        assert!(msg.is_overflowed());
        // cursor was reset, nothing partially written
        assert_eq!(msg.len(), 0);

        msg.begin_writing();
        assert!(!msg.is_overflowed());
        msg.write_u16(7).unwrap();
        assert_eq!(msg.len(), 2);
    }

    #[test]
    fn test_read_past_end() {
        let mut msg = BitMessage::with_capacity(8);
        msg.write_u8(9).unwrap();
        msg.begin_reading();
        assert_eq!(msg.read_u8().unwrap(), 9);
        assert_eq!(msg.read_u8(), Err(MessageError::OutOfData));
    }

    #[test]
    fn test_write_state_patching() {
        let mut msg = BitMessage::with_capacity(64);
        let placeholder = msg.save_write_state();
        msg.write_u8(0).unwrap();
        msg.write_u16(0xBEEF).unwrap();
        msg.write_u16(0xCAFE).unwrap();

        let end = msg.save_write_state();
        msg.restore_write_state(placeholder);
        msg.write_u8(2).unwrap();
        msg.restore_write_state(end);

        msg.begin_reading();
        assert_eq!(msg.read_u8().unwrap(), 2);
        assert_eq!(msg.read_u16().unwrap(), 0xBEEF);
        assert_eq!(msg.read_u16().unwrap(), 0xCAFE);
    }

    #[test]
    fn test_read_state_rewind() {
        let mut msg = BitMessage::with_capacity(64);
        msg.write_u16(111).unwrap();
        msg.write_u16(222).unwrap();

        msg.begin_reading();
        assert_eq!(msg.read_u16().unwrap(), 111);
        let mark = msg.save_read_state();
        assert_eq!(msg.read_u16().unwrap(), 222);
        msg.restore_read_state(mark);
        assert_eq!(msg.read_u16().unwrap(), 222);
    }

    #[test]
    fn test_write_data_read_data() {
        let mut msg = BitMessage::with_capacity(64);
        msg.write_bits(1, 1).unwrap();
        msg.write_data(&[10, 20, 30]).unwrap();

        msg.begin_reading();
        assert_eq!(msg.read_bits(1).unwrap(), 1);
        let mut out = [0u8; 8];
        // aligned to the next byte, then truncated at end of data
        assert_eq!(msg.read_data(&mut out), 3);
        assert_eq!(&out[..3], &[10, 20, 30]);
    }

    #[test]
    fn test_from_bytes_reads_back() {
        let mut msg = BitMessage::from_bytes(&[0xEF, 0xBE]);
        assert_eq!(msg.len(), 2);
        assert_eq!(msg.read_u16().unwrap(), 0xBEEF);
    }

    #[test]
    #[should_panic]
    fn test_value_out_of_range_is_a_bug() {
        let mut msg = BitMessage::with_capacity(8);
        let _ = msg.write_bits(16, 4);
    }
}
