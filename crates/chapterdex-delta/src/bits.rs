//! Little-endian bit-field access over byte buffers.
//!
//! Bit `n` of a buffer is bit `n % 8` of byte `n / 8`. Every accessor here
//! loads whole 32- or 64-bit words, so a buffer must carry
//! [`POST_FIELD_GUARD_BYTES`] readable bytes after the last byte of any
//! field it holds. Delta zones and pages reserve that tail as a guard list.

/// Largest field `read_big_field`/`write_big_field` move in one load.
pub const MAX_BIG_FIELD_BITS: u32 = (u64::BITS - 1) / 8 * 8 + 1;

/// Bytes that must stay addressable after the last byte of a field.
pub const POST_FIELD_GUARD_BYTES: usize = 7;

/// Size of the tail guard list, in bits. The bytes are all ones, so unary
/// decoding always terminates inside the buffer.
pub const GUARD_BITS: u32 = (POST_FIELD_GUARD_BYTES * 8) as u32;

const U32_BITS: u64 = 32;

#[inline]
pub(crate) fn load_le32(memory: &[u8], byte: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&memory[byte..byte + 4]);
    u32::from_le_bytes(raw)
}

#[inline]
fn store_le32(memory: &mut [u8], byte: usize, value: u32) {
    memory[byte..byte + 4].copy_from_slice(&value.to_le_bytes());
}

#[inline]
fn load_le64(memory: &[u8], byte: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&memory[byte..byte + 8]);
    u64::from_le_bytes(raw)
}

#[inline]
fn store_le64(memory: &mut [u8], byte: usize, value: u64) {
    memory[byte..byte + 8].copy_from_slice(&value.to_le_bytes());
}

#[inline]
const fn mask64(size: u32) -> u64 {
    if size >= u64::BITS {
        u64::MAX
    } else {
        (1u64 << size) - 1
    }
}

/// Read a field of at most 32 bits.
#[inline]
pub fn read_field(memory: &[u8], offset: u64, size: u32) -> u32 {
    debug_assert!(size <= 32);
    let shift = (offset % 8) as u32;
    ((load_le64(memory, (offset / 8) as usize) >> shift) & mask64(size)) as u32
}

/// Write a field of at most 32 bits. Bits of `value` above `size` are dropped.
#[inline]
pub fn write_field(memory: &mut [u8], offset: u64, size: u32, value: u32) {
    debug_assert!(size <= 32);
    write_big_field_raw(memory, offset, size, u64::from(value) & mask64(size));
}

#[inline]
fn read_big_field_raw(memory: &[u8], offset: u64, size: u32) -> u64 {
    let shift = (offset % 8) as u32;
    (load_le64(memory, (offset / 8) as usize) >> shift) & mask64(size)
}

#[inline]
fn write_big_field_raw(memory: &mut [u8], offset: u64, size: u32, value: u64) {
    let byte = (offset / 8) as usize;
    let shift = (offset % 8) as u32;
    let mut data = load_le64(memory, byte);
    data &= !(mask64(size) << shift);
    data |= value << shift;
    store_le64(memory, byte, data);
}

/// Read a field of up to 64 bits.
pub fn read_big_field(memory: &[u8], offset: u64, size: u32) -> u64 {
    debug_assert!(size <= u64::BITS);
    if size <= MAX_BIG_FIELD_BITS {
        return read_big_field_raw(memory, offset, size);
    }
    let low = read_big_field_raw(memory, offset, 32);
    let high = read_big_field_raw(memory, offset + 32, size - 32);
    low | (high << 32)
}

/// Write a field of up to 64 bits.
pub fn write_big_field(memory: &mut [u8], offset: u64, size: u32, value: u64) {
    debug_assert!(size <= u64::BITS);
    let value = value & mask64(size);
    if size <= MAX_BIG_FIELD_BITS {
        write_big_field_raw(memory, offset, size, value);
        return;
    }
    write_big_field_raw(memory, offset, 32, value & mask64(32));
    write_big_field_raw(memory, offset + 32, size - 32, value >> 32);
}

/// Clear `size` bits starting at `offset`.
pub fn set_zero(memory: &mut [u8], offset: u64, size: u32) {
    if size == 0 {
        return;
    }
    let mut byte = (offset / 8) as usize;
    let shift = (offset % 8) as u32;
    let count = if size + shift > 8 { 8 - shift } else { size };
    memory[byte] &= !((((1u32 << count) - 1) << shift) as u8);
    byte += 1;
    let mut size = size - count;
    while size > 8 {
        memory[byte] = 0;
        byte += 1;
        size -= 8;
    }
    if size > 0 {
        memory[byte] &= (0xFFu32 << size) as u8;
    }
}

/// Copy `size` bits within one buffer. Overlapping ranges behave as if the
/// source were first copied to a temporary.
pub fn move_bits_within(memory: &mut [u8], source: u64, destination: u64, size: u64) {
    if size <= u64::from(MAX_BIG_FIELD_BITS) {
        if size > 0 {
            let field = read_big_field_raw(memory, source, size as u32);
            write_big_field_raw(memory, destination, size as u32, field);
        }
        return;
    }
    if source > destination {
        move_bits_down(memory, source, destination, size);
    } else {
        move_bits_up(memory, source, destination, size);
    }
}

/// Lower addresses first. The first chunk ends on a 32-bit destination
/// boundary so the main loop can store aligned words.
fn move_bits_down(memory: &mut [u8], mut source: u64, mut destination: u64, mut size: u64) {
    let big = u64::from(MAX_BIG_FIELD_BITS);
    let count = big - ((destination + big) % U32_BITS);
    let field = read_big_field_raw(memory, source, count as u32);
    write_big_field_raw(memory, destination, count as u32, field);
    source += count;
    destination += count;
    size -= count;

    let offset = source % U32_BITS;
    let mut src = ((source - offset) / 8) as usize;
    let mut dest = (destination / 8) as usize;
    while size > big {
        let word = (load_le64(memory, src) >> offset) as u32;
        store_le32(memory, dest, word);
        src += 4;
        dest += 4;
        source += U32_BITS;
        destination += U32_BITS;
        size -= U32_BITS;
    }

    if size > 0 {
        let field = read_big_field_raw(memory, source, size as u32);
        write_big_field_raw(memory, destination, size as u32, field);
    }
}

/// Higher addresses first, mirroring `move_bits_down`.
fn move_bits_up(memory: &mut [u8], source: u64, destination: u64, mut size: u64) {
    let big = u64::from(MAX_BIG_FIELD_BITS);
    let count = (destination + size) % U32_BITS;
    if count > 0 {
        size -= count;
        let field = read_big_field_raw(memory, source + size, count as u32);
        write_big_field_raw(memory, destination + size, count as u32, field);
    }

    let offset = (source + size) % U32_BITS;
    let mut src = ((source + size - offset) / 8) as usize;
    let mut dest = ((destination + size) / 8) as usize;
    while size > big {
        src -= 4;
        dest -= 4;
        size -= U32_BITS;
        let word = (load_le64(memory, src) >> offset) as u32;
        store_le32(memory, dest, word);
    }

    if size > 0 {
        let field = read_big_field_raw(memory, source, size as u32);
        write_big_field_raw(memory, destination, size as u32, field);
    }
}

/// Copy `size` bits between two distinct buffers.
pub fn move_bits(src: &[u8], source: u64, dst: &mut [u8], destination: u64, size: u64) {
    let big = u64::from(MAX_BIG_FIELD_BITS);
    let mut moved = 0;
    while moved < size {
        let count = (size - moved).min(big) as u32;
        let field = read_big_field_raw(src, source + moved, count);
        write_big_field_raw(dst, destination + moved, count, field);
        moved += u64::from(count);
    }
}

/// Read `out.len()` whole bytes starting at an arbitrary bit offset.
pub fn read_bytes(memory: &[u8], offset: u64, out: &mut [u8]) {
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = read_field(memory, offset + 8 * i as u64, 8) as u8;
    }
}

/// Write whole bytes starting at an arbitrary bit offset.
pub fn write_bytes(memory: &mut [u8], offset: u64, bytes: &[u8]) {
    for (i, &byte) in bytes.iter().enumerate() {
        write_field(memory, offset + 8 * i as u64, 8, u32::from(byte));
    }
}
