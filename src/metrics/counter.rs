use std::fmt;
use std::ops::{AddAssign, SubAssign};

use crate::error::Error;
use crate::metrics::Accumulate;

/// A named arithmetic counter.
#[derive(Debug, Clone)]
pub struct Counter<T> {
    name: String,
    counter: T,
}

impl<T> Counter<T>
where
    T: Copy + Default + AddAssign + SubAssign + From<u8> + PartialEq,
{
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            counter: T::default(),
        }
    }

    pub fn with_value(name: impl Into<String>, counter: T) -> Self {
        Self {
            name: name.into(),
            counter,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get(&self) -> T {
        self.counter
    }

    pub fn set(&mut self, value: T) {
        self.counter = value;
    }

    pub fn increment(&mut self) {
        self.counter += T::from(1);
    }

    pub fn decrement(&mut self) {
        self.counter -= T::from(1);
    }
}

impl<T: AddAssign> AddAssign<T> for Counter<T> {
    fn add_assign(&mut self, rhs: T) {
        self.counter += rhs;
    }
}

impl<T: SubAssign> SubAssign<T> for Counter<T> {
    fn sub_assign(&mut self, rhs: T) {
        self.counter -= rhs;
    }
}

impl<T: PartialEq> PartialEq for Counter<T> {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.counter == other.counter
    }
}

impl<T: fmt::Display> fmt::Display for Counter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "count: {}", self.counter)
    }
}

impl<T> Accumulate for Counter<T>
where
    T: Copy + AddAssign,
{
    fn accumulate(&mut self, other: &Self) -> crate::Result<()> {
        if self.name != other.name {
            return Err(Error::FailedPrecondition(format!(
                "counter name does not match: {}",
                other.name
            )));
        }
        self.counter += other.counter;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arithmetic() {
        let mut c = Counter::<u64>::new("ops");
        c.increment();
        c += 10;
        c -= 2;
        assert_eq!(c.get(), 9);
        c.decrement();
        assert_eq!(c.get(), 8);
        assert_eq!(c.to_string(), "count: 8");
    }

    #[test]
    fn accumulate_requires_matching_names() {
        let mut a = Counter::<u64>::with_value("ops", 5);
        let b = Counter::<u64>::with_value("ops", 7);
        a.accumulate(&b).unwrap();
        assert_eq!(a.get(), 12);

        let c = Counter::<u64>::with_value("other", 1);
        assert!(matches!(
            a.accumulate(&c),
            Err(Error::FailedPrecondition(_))
        ));
    }

    #[test]
    fn equality_includes_the_name() {
        let a = Counter::<u64>::with_value("x", 1);
        let b = Counter::<u64>::with_value("x", 1);
        let c = Counter::<u64>::with_value("y", 1);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
