//! Prior distributions over sampling-space variables.

use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

use sx_types::{config_error, SxResult};

/// Prior density of a single variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Prior {
    Uniform { minimum: f64, maximum: f64 },
    Normal { mean: f64, standard_deviation: f64 },
}

impl Prior {
    /// Log density at `x`; `-inf` outside the support.
    pub fn log_density(&self, x: f64) -> f64 {
        match *self {
            Prior::Uniform { minimum, maximum } => {
                if x < minimum || x > maximum {
                    f64::NEG_INFINITY
                } else {
                    -(maximum - minimum).ln()
                }
            }
            Prior::Normal {
                mean,
                standard_deviation,
            } => {
                let z = (x - mean) / standard_deviation;
                -0.5 * z * z - standard_deviation.ln() - 0.5 * (2.0 * PI).ln()
            }
        }
    }

    pub fn validate(&self, component: &str, variable: &str) -> SxResult<()> {
        match *self {
            Prior::Uniform { minimum, maximum } if !(minimum < maximum) => Err(config_error!(
                component,
                format!("{variable}.Prior"),
                "uniform minimum ({minimum}) must be below maximum ({maximum})"
            )),
            Prior::Normal {
                standard_deviation, ..
            } if !(standard_deviation > 0.0) => Err(config_error!(
                component,
                format!("{variable}.Prior"),
                "normal standard deviation must be positive (is {standard_deviation})"
            )),
            _ => Ok(()),
        }
    }
}

/// Sum of per-variable log priors.
pub fn log_prior(priors: &[Prior], point: &[f64]) -> f64 {
    priors
        .iter()
        .zip(point)
        .map(|(prior, x)| prior.log_density(*x))
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniform_is_flat_inside_and_impossible_outside() {
        let prior = Prior::Uniform {
            minimum: -2.0,
            maximum: 2.0,
        };
        assert!((prior.log_density(0.3) - (-(4.0f64).ln())).abs() < 1e-12);
        assert_eq!(prior.log_density(2.5), f64::NEG_INFINITY);
    }

    #[test]
    fn normal_peaks_at_mean() {
        let prior = Prior::Normal {
            mean: 1.0,
            standard_deviation: 2.0,
        };
        assert!(prior.log_density(1.0) > prior.log_density(2.0));
        assert!((prior.log_density(3.0) - prior.log_density(-1.0)).abs() < 1e-12);
    }

    #[test]
    fn one_impossible_coordinate_makes_the_point_impossible() {
        let priors = vec![
            Prior::Uniform { minimum: 0.0, maximum: 1.0 },
            Prior::Uniform { minimum: 0.0, maximum: 1.0 },
        ];
        assert!(log_prior(&priors, &[0.5, 0.5]).is_finite());
        assert_eq!(log_prior(&priors, &[0.5, 1.5]), f64::NEG_INFINITY);
    }

    #[test]
    fn degenerate_priors_are_configuration_errors() {
        let prior = Prior::Uniform { minimum: 1.0, maximum: 1.0 };
        let err = prior.validate("MCMC", "x").unwrap_err();
        assert!(err.to_string().contains("x.Prior"));
    }
}
