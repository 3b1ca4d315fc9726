//! Guest memory exchange with the host.
//!
//! The host writes request bytes into a buffer obtained from `mx_alloc` and
//! reads replies from a packed `(ptr << 32) | len` i64.

use std::sync::Mutex;

/// Holds the last reply so its bytes stay valid until the host has read
/// them.
static OUTPUT: Mutex<Vec<u8>> = Mutex::new(Vec::new());

/// Packs a guest `(ptr, len)` pair.
#[must_use]
pub const fn pack(ptr: u32, len: u32) -> i64 {
    (((ptr as u64) << 32) | len as u64) as i64
}

/// Inverse of [`pack`].
#[must_use]
pub const fn unpack(packed: i64) -> (u32, u32) {
    let bits = packed as u64;
    ((bits >> 32) as u32, bits as u32)
}

/// A zeroed buffer of exactly `len` bytes, ownership passed to the caller.
pub fn alloc(len: usize) -> *mut u8 {
    let buf = vec![0u8; len].into_boxed_slice();
    Box::into_raw(buf).cast::<u8>()
}

/// Takes back a buffer handed out by [`alloc`].
///
/// # Safety
///
/// `ptr` and `len` must come from one earlier [`alloc`] call, and the
/// buffer must not have been taken back already.
pub unsafe fn take_input(ptr: *mut u8, len: usize) -> Vec<u8> {
    let slice = std::ptr::slice_from_raw_parts_mut(ptr, len);
    // SAFETY: guaranteed by the caller.
    unsafe { Box::from_raw(slice) }.into_vec()
}

/// Stores `bytes` as the current reply and returns its packed location.
/// Only meaningful on 32-bit guests.
pub fn write_output(bytes: Vec<u8>) -> i64 {
    let mut output = OUTPUT.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
    *output = bytes;
    pack(output.as_ptr() as usize as u32, output.len() as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_puts_pointer_high_and_length_low() {
        assert_eq!(pack(0, 39), 39);
        assert_eq!(pack(1, 0), 1 << 32);
        assert_eq!(unpack(pack(0xDEAD_BEEF, 0x1234)), (0xDEAD_BEEF, 0x1234));
    }

    #[test]
    fn alloc_and_take_back() {
        let ptr = alloc(4);
        // SAFETY: ptr points to 4 writable bytes from alloc.
        unsafe {
            ptr.copy_from_nonoverlapping(b"ping".as_ptr(), 4);
            assert_eq!(take_input(ptr, 4), b"ping");
        }
    }

    #[test]
    fn zero_length_alloc_round_trips() {
        let ptr = alloc(0);
        // SAFETY: ptr comes from alloc(0).
        assert!(unsafe { take_input(ptr, 0) }.is_empty());
    }

    #[test]
    fn write_output_reports_length() {
        let packed = write_output(b"hello".to_vec());
        assert_eq!(unpack(packed).1, 5);
    }
}
