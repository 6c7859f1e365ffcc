//! Model description files (TOML).
//!
//! A model file lists the compartments, parameter links, bound overrides,
//! optional multi-tissue S0 responses and the solver settings:
//!
//! ```toml
//! representation = "full"
//!
//! [[compartments]]
//! kind = "stick"
//!
//! [[compartments]]
//! kind = "ball"
//!
//! [[links]]
//! kind = "fixed"
//! parameter = "G1Ball_1_lambda_iso"
//! values = [3e-9]
//!
//! [solver]
//! solver = "mix"
//! ```

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::domain::{DistributionKind, FitConfig, KernelKind, Representation};
use crate::error::AppError;
use crate::models::distributed::DEFAULT_QUADRATURE_POINTS;
use crate::models::{Compartment, DistributedBundle, MultiCompartmentModel, ParameterLink};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum CompartmentSpec {
    Stick,
    Ball,
    Zeppelin,
    Cylinder,
    Watson {
        kernels: Vec<KernelKind>,
        #[serde(default = "default_quadrature_points")]
        quadrature_points: usize,
    },
    Bingham {
        kernels: Vec<KernelKind>,
        #[serde(default = "default_quadrature_points")]
        quadrature_points: usize,
    },
}

fn default_quadrature_points() -> usize {
    DEFAULT_QUADRATURE_POINTS
}

impl CompartmentSpec {
    pub fn build(&self) -> Result<Compartment, AppError> {
        match self {
            CompartmentSpec::Stick => Ok(Compartment::stick()),
            CompartmentSpec::Ball => Ok(Compartment::Ball),
            CompartmentSpec::Zeppelin => Ok(Compartment::zeppelin()),
            CompartmentSpec::Cylinder => Ok(Compartment::cylinder()),
            CompartmentSpec::Watson {
                kernels,
                quadrature_points,
            } => DistributedBundle::new(DistributionKind::Watson, kernels.clone(), *quadrature_points)
                .map(Compartment::Distributed),
            CompartmentSpec::Bingham {
                kernels,
                quadrature_points,
            } => DistributedBundle::new(DistributionKind::Bingham, kernels.clone(), *quadrature_points)
                .map(Compartment::Distributed),
        }
    }

    pub fn from_compartment(compartment: &Compartment) -> Self {
        match compartment {
            Compartment::Ball => CompartmentSpec::Ball,
            Compartment::Oriented(KernelKind::Stick) => CompartmentSpec::Stick,
            Compartment::Oriented(KernelKind::Zeppelin) => CompartmentSpec::Zeppelin,
            Compartment::Oriented(KernelKind::Cylinder) => CompartmentSpec::Cylinder,
            Compartment::Distributed(bundle) => {
                let kernels = bundle.kernels().to_vec();
                let quadrature_points = bundle.quadrature_points();
                match bundle.distribution() {
                    DistributionKind::Watson => CompartmentSpec::Watson {
                        kernels,
                        quadrature_points,
                    },
                    DistributionKind::Bingham => CompartmentSpec::Bingham {
                        kernels,
                        quadrature_points,
                    },
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum LinkSpec {
    Fixed {
        parameter: String,
        values: Vec<f64>,
    },
    Equal {
        parameter: String,
        source: String,
    },
    Tortuous {
        parameter: String,
        lambda_par: String,
        vf_intra: String,
        vf_extra: String,
    },
}

impl LinkSpec {
    fn from_link(parameter: String, link: ParameterLink) -> Self {
        match link {
            ParameterLink::Fixed(values) => LinkSpec::Fixed { parameter, values },
            ParameterLink::Equal(source) => LinkSpec::Equal { parameter, source },
            ParameterLink::Tortuous {
                lambda_par,
                vf_intra,
                vf_extra,
            } => LinkSpec::Tortuous {
                parameter,
                lambda_par,
                vf_intra,
                vf_extra,
            },
        }
    }

    fn apply(&self, model: &mut MultiCompartmentModel) -> Result<(), AppError> {
        match self {
            LinkSpec::Fixed { parameter, values } => model.set_fixed_parameter(parameter, values.clone()),
            LinkSpec::Equal { parameter, source } => model.set_equal_parameter(parameter, source),
            LinkSpec::Tortuous {
                parameter,
                lambda_par,
                vf_intra,
                vf_extra,
            } => model.set_tortuous_parameter(parameter, lambda_par, vf_intra, vf_extra),
        }
    }
}

/// Optimisation bound override, in scaled units (e.g. 1e-9 m²/s for
/// diffusivities).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundsSpec {
    pub parameter: String,
    pub bounds: Vec<(f64, f64)>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelFile {
    #[serde(default)]
    pub representation: Representation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s0_responses: Option<Vec<f64>>,
    pub compartments: Vec<CompartmentSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub links: Vec<LinkSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bounds: Vec<BoundsSpec>,
    #[serde(default)]
    pub solver: FitConfig,
}

impl ModelFile {
    /// Build the model. Links are applied in file order; bounds after links.
    pub fn build(&self) -> Result<MultiCompartmentModel, AppError> {
        if self.compartments.is_empty() {
            return Err(AppError::input("Model file lists no compartments."));
        }
        let compartments = self
            .compartments
            .iter()
            .map(CompartmentSpec::build)
            .collect::<Result<Vec<_>, _>>()?;
        let mut model = MultiCompartmentModel::with_representation(compartments, self.representation)?;
        for link in &self.links {
            link.apply(&mut model)?;
        }
        for b in &self.bounds {
            model.set_parameter_optimization_bounds(&b.parameter, b.bounds.clone())?;
        }
        if let Some(s0) = &self.s0_responses {
            model.set_s0_responses(s0.clone())?;
        }
        debug!(
            compartments = model.n_compartments(),
            optimized = model.optimized_len(),
            "model built"
        );
        Ok(model)
    }

    /// Describe an existing model. Bound overrides are not recovered.
    pub fn from_model(model: &MultiCompartmentModel, solver: FitConfig) -> Self {
        Self {
            representation: model.representation(),
            compartments: model.compartments().iter().map(CompartmentSpec::from_compartment).collect(),
            links: model
                .links()
                .into_iter()
                .map(|(name, link)| LinkSpec::from_link(name, link))
                .collect(),
            bounds: Vec::new(),
            s0_responses: model.s0_responses().map(<[f64]>::to_vec),
            solver,
        }
    }
}

pub fn parse_model_file(text: &str) -> Result<ModelFile, AppError> {
    toml::from_str(text).map_err(|e| AppError::input(format!("Invalid model file: {e}")))
}

pub fn read_model_file(path: &Path) -> Result<ModelFile, AppError> {
    let text = fs::read_to_string(path)
        .map_err(|e| AppError::input(format!("Failed to read model file '{}': {e}", path.display())))?;
    parse_model_file(&text).map_err(|e| AppError::input(format!("{}: {}", path.display(), e.message())))
}

pub fn write_model_file(path: &Path, file: &ModelFile) -> Result<(), AppError> {
    let text =
        toml::to_string_pretty(file).map_err(|e| AppError::input(format!("Failed to serialise model: {e}")))?;
    fs::write(path, text)
        .map_err(|e| AppError::input(format!("Failed to write model file '{}': {e}", path.display())))
}
