/// Rewrites DNS messages carried in UDP port 53 datagrams.
///
/// `payload` starts at the DNS message and extends to the end of the output
/// buffer, the first `len` bytes are valid. The returned value is the new
/// message length; values larger than `payload.len()` cause the packet to be
/// dropped.
pub trait Dns64Rewriter: Send + Sync {
    fn rewrite_query(&self, payload: &mut [u8], len: usize) -> usize;

    fn rewrite_response(&self, payload: &mut [u8], len: usize) -> usize;
}

/// Leaves DNS messages untouched.
#[derive(Default)]
pub struct PassthroughDns64 {}

impl Dns64Rewriter for PassthroughDns64 {
    fn rewrite_query(&self, _payload: &mut [u8], len: usize) -> usize {
        len
    }

    fn rewrite_response(&self, _payload: &mut [u8], len: usize) -> usize {
        len
    }
}
