//! A growable byte buffer for draining child-process pipes without knowing
//! their output size up front. Invariant: `remaining() >= headroom()`,
//! restored by doubling growth (`headroom * 2`) whenever a read would
//! violate it.

use std::os::fd::RawFd;

use nix::unistd::read;

#[derive(Debug)]
pub struct ElasticBuffer {
    data: Vec<u8>,
    headroom: usize,
}

impl ElasticBuffer {
    pub fn new(initial_capacity: usize, headroom: usize) -> Self {
        let mut buf = ElasticBuffer {
            data: Vec::with_capacity(initial_capacity.max(headroom)),
            headroom,
        };
        buf.ensure_headroom();
        buf
    }

    pub fn used(&self) -> usize {
        self.data.len()
    }

    pub fn remaining(&self) -> usize {
        self.data.capacity() - self.data.len()
    }

    pub fn headroom(&self) -> usize {
        self.headroom
    }

    fn ensure_headroom(&mut self) {
        while self.remaining() < self.headroom {
            self.data.reserve(self.headroom * 2);
        }
    }

    /// Reads whatever is available from `fd` directly into the buffer's
    /// spare capacity, growing first if headroom would otherwise be
    /// violated. Returns the number of bytes read (0 on EOF).
    pub fn fill_from_fd(&mut self, fd: RawFd) -> nix::Result<usize> {
        self.ensure_headroom();
        let start = self.data.len();
        let cap = self.data.capacity();
        self.data.resize(cap, 0);
        let result = read(fd, &mut self.data[start..cap]);
        match result {
            Ok(n) => {
                self.data.truncate(start + n);
                Ok(n)
            }
            Err(e) => {
                self.data.truncate(start);
                Err(e)
            }
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_with_at_least_headroom_available() {
        let buf = ElasticBuffer::new(4, 64);
        assert!(buf.remaining() >= buf.headroom());
    }

    #[test]
    fn growth_preserves_the_headroom_invariant() {
        let mut buf = ElasticBuffer::new(4, 16);
        for _ in 0..5 {
            buf.ensure_headroom();
            buf.data.resize(buf.data.len() + buf.headroom, 0);
            assert!(buf.remaining() <= buf.data.capacity());
        }
    }
}
