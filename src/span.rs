/// A byte range into a diagnostic snippet (printed IR or a config file).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Span {
    pub start: u32,
    pub end: u32,
}

impl Span {
    pub fn new(start: u32, end: u32) -> Self {
        Self { start, end }
    }

    pub fn dummy() -> Self {
        Self { start: 0, end: 0 }
    }

    pub fn is_dummy(&self) -> bool {
        self.start == 0 && self.end == 0
    }

    pub fn range(&self) -> std::ops::Range<usize> {
        self.start as usize..self.end as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dummy_span() {
        assert!(Span::dummy().is_dummy());
        assert!(!Span::new(3, 7).is_dummy());
        assert_eq!(Span::new(3, 7).range(), 3..7);
    }
}
