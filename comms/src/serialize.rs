use std::io;

/// Types that can be written into an outgoing frame.
pub trait Serialize<'a> {
    /// Appends the copied part of `self` to `buf`.
    ///
    /// # Arguments
    /// * `buf` - The frame being built, the length prefix is already in place.
    ///
    /// # Returns
    /// An optional slice of bytes to be written right after `buf` without copying,
    /// or an error if `self` can't be encoded.
    fn serialize(&'a self, buf: &mut Vec<u8>) -> io::Result<Option<&'a [u8]>>;
}
