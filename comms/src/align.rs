/// Element types a receive buffer can be made of.
///
/// Partial results carry `f32` values, so the buffer backing a received
/// message must be at least 4 byte aligned for them to be viewed in place.
pub trait Align4: bytemuck::Pod {}

impl Align4 for u32 {}
impl Align4 for i32 {}
impl Align4 for u64 {}
impl Align4 for i64 {}
impl Align4 for f32 {}
impl Align4 for f64 {}
