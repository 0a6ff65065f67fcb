use crate::{EvalErr, Result};

/// An increasing sequence of fractions of the available units.
#[derive(Debug, Clone, PartialEq)]
pub struct Schedule {
    fractions: Vec<f64>,
}

impl Schedule {
    /// Creates a schedule from explicit fractions.
    ///
    /// # Errors
    /// Fails unless the fractions are non empty, strictly increasing and within `[0, 1]`.
    pub fn new(fractions: Vec<f64>) -> Result<Self> {
        if fractions.is_empty() {
            return Err(EvalErr::config("a schedule needs at least one step"));
        }

        if let Some(f) = fractions.iter().find(|f| !(0.0..=1.0).contains(*f)) {
            return Err(EvalErr::config(format!("schedule fraction {f} is outside [0, 1]")));
        }

        if fractions.windows(2).any(|pair| pair[0] >= pair[1]) {
            return Err(EvalErr::config("schedule fractions must be strictly increasing"));
        }

        Ok(Self { fractions })
    }

    /// `num_steps` evenly spaced fractions from `start` to `stop`, both included.
    pub fn linspace(start: f64, stop: f64, num_steps: usize) -> Result<Self> {
        if num_steps == 0 {
            return Err(EvalErr::config("a schedule needs at least one step"));
        }

        if num_steps == 1 {
            return Self::new(vec![start]);
        }

        let last = num_steps - 1;
        let fractions = (0..num_steps)
            .map(|i| match i {
                i if i == last => stop,
                i => start + (stop - start) * i as f64 / last as f64,
            })
            .collect();

        Self::new(fractions)
    }

    pub fn fractions(&self) -> &[f64] {
        &self.fractions
    }

    pub fn len(&self) -> usize {
        self.fractions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fractions.is_empty()
    }

    /// Converts every fraction into an amount of units out of `total`.
    pub fn units(&self, total: usize) -> Vec<usize> {
        self.fractions
            .iter()
            .map(|f| ((f * total as f64).floor() as usize).min(total))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linspace_hits_both_ends() {
        let schedule = Schedule::linspace(0.0, 1.0, 5).unwrap();
        assert_eq!(schedule.fractions(), &[0.0, 0.25, 0.5, 0.75, 1.0]);
        assert_eq!(schedule.units(10), vec![0, 2, 5, 7, 10]);
    }

    #[test]
    fn invalid_schedules_are_rejected() {
        assert!(Schedule::linspace(0.5, 0.1, 3).is_err());
        assert!(Schedule::linspace(0.0, 1.5, 3).is_err());
        assert!(Schedule::linspace(0.0, 1.0, 0).is_err());
        assert!(Schedule::new(vec![0.2, 0.2]).is_err());
    }
}
