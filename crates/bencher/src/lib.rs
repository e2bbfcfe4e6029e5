#[derive(Debug, Copy, Clone)]
pub struct TestCase {
    name: &'static str,
    group: TestGroup,
    headers: HeaderSet,
}

impl TestCase {
    pub fn new(name: &'static str, group: TestGroup, headers: HeaderSet) -> Self {
        Self { name, group, headers }
    }

    pub fn small(name: &'static str, headers: HeaderSet) -> Self {
        Self::new(name, TestGroup::Small, headers)
    }

    pub fn normal(name: &'static str, headers: HeaderSet) -> Self {
        Self::new(name, TestGroup::Normal, headers)
    }

    pub fn large(name: &'static str, headers: HeaderSet) -> Self {
        Self::new(name, TestGroup::Large, headers)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn group(&self) -> TestGroup {
        self.group
    }

    pub fn headers(&self) -> &HeaderSet {
        &self.headers
    }
}

/// Flattened `name, value, name, value, ...` header arguments.
#[derive(Debug, Copy, Clone)]
pub struct HeaderSet {
    flat: &'static [&'static str],
}

impl HeaderSet {
    pub const fn new(flat: &'static [&'static str]) -> Self {
        Self { flat }
    }

    pub fn flat(&self) -> &'static [&'static str] {
        self.flat
    }

    pub fn pair_count(&self) -> usize {
        self.flat.len() / 2
    }

    /// Header names in argument order, repeats included.
    pub fn names(&self) -> impl Iterator<Item = &'static str> {
        self.flat.iter().step_by(2).copied()
    }
}

#[derive(Clone, Copy, Debug)]
pub enum TestGroup {
    Small,
    Normal,
    Large,
}
