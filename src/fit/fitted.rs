//! Results of a volume fit.

use std::collections::BTreeMap;

use nalgebra::Vector3;

use crate::acquisition::AcquisitionScheme;
use crate::domain::{SignalMatrix, SolverKind};
use crate::error::AppError;
use crate::fit::csd::{CsdKernel, Peak, PeakOptions, SH_COEFF, find_peaks};
use crate::fit::fitter::prepare_signal;
use crate::math::sh::sh_to_sf;
use crate::models::MultiCompartmentModel;

#[derive(Debug, Clone)]
pub struct FittedModel {
    model: MultiCompartmentModel,
    solver: SolverKind,
    names: Vec<String>,
    cardinalities: Vec<usize>,
    parameters: Vec<Vec<f64>>,
    success: Vec<bool>,
    s0: Vec<f64>,
    csd: Option<(CsdKernel, usize)>,
}

impl FittedModel {
    pub(crate) fn new(
        model: MultiCompartmentModel,
        solver: SolverKind,
        outputs: Vec<(String, usize)>,
        parameters: Vec<Vec<f64>>,
        success: Vec<bool>,
        s0: Vec<f64>,
        csd: Option<(CsdKernel, usize)>,
    ) -> Self {
        let (names, cardinalities) = outputs.into_iter().unzip();
        Self {
            model,
            solver,
            names,
            cardinalities,
            parameters,
            success,
            s0,
            csd,
        }
    }

    pub fn model(&self) -> &MultiCompartmentModel {
        &self.model
    }

    pub fn solver(&self) -> SolverKind {
        self.solver
    }

    pub fn n_voxels(&self) -> usize {
        self.parameters.len()
    }

    pub fn parameter_names(&self) -> &[String] {
        &self.names
    }

    pub fn parameter_cardinalities(&self) -> &[usize] {
        &self.cardinalities
    }

    /// Output vector of every voxel (`NaN` for failed voxels).
    pub fn parameter_vectors(&self) -> &[Vec<f64>] {
        &self.parameters
    }

    pub fn success(&self) -> &[bool] {
        &self.success
    }

    pub fn s0(&self) -> &[f64] {
        &self.s0
    }

    /// SH order of a CSD fit.
    pub fn sh_order(&self) -> Option<usize> {
        self.csd.as_ref().map(|(_, lmax)| *lmax)
    }

    fn offset_of(&self, name: &str) -> Result<(usize, usize), AppError> {
        let mut offset = 0;
        for (n, &c) in self.names.iter().zip(&self.cardinalities) {
            if n == name {
                return Ok((offset, c));
            }
            offset += c;
        }
        Err(AppError::input(format!(
            "Unknown fitted parameter '{name}'. Known: {}.",
            self.names.join(", ")
        )))
    }

    /// Per-voxel values of one parameter.
    pub fn fitted_parameter(&self, name: &str) -> Result<Vec<Vec<f64>>, AppError> {
        let (offset, len) = self.offset_of(name)?;
        Ok(self.parameters.iter().map(|p| p[offset..offset + len].to_vec()).collect())
    }

    /// Per-voxel values of a scalar parameter.
    pub fn fitted_scalar(&self, name: &str) -> Result<Vec<f64>, AppError> {
        let (offset, len) = self.offset_of(name)?;
        if len != 1 {
            return Err(AppError::input(format!("Parameter '{name}' is not a scalar.")));
        }
        Ok(self.parameters.iter().map(|p| p[offset]).collect())
    }

    pub fn fitted_parameters(&self) -> Result<BTreeMap<String, Vec<Vec<f64>>>, AppError> {
        self.names
            .iter()
            .map(|n| Ok((n.clone(), self.fitted_parameter(n)?)))
            .collect()
    }

    /// Predicted attenuation per voxel, in the model representation.
    fn predicted_attenuation(&self, scheme: &AcquisitionScheme) -> Result<Vec<Vec<f64>>, AppError> {
        let len = match &self.csd {
            Some(_) => scheme.n_measurements(),
            None => self.model.signal_len(scheme),
        };
        let mut out = Vec::with_capacity(self.n_voxels());
        for (p, &ok) in self.parameters.iter().zip(&self.success) {
            if !ok {
                out.push(vec![f64::NAN; len]);
                continue;
            }
            let e = match &self.csd {
                Some((kernel, lmax)) => kernel.predict(scheme, *lmax, p),
                None => self.model.simulate_signal(scheme, p)?,
            };
            out.push(e);
        }
        Ok(out)
    }

    /// Predicted signal (`S0 × E`) per voxel.
    pub fn predict(&self, scheme: &AcquisitionScheme) -> Result<Vec<Vec<f64>>, AppError> {
        let attenuation = self.predicted_attenuation(scheme)?;
        Ok(attenuation
            .into_iter()
            .zip(&self.s0)
            .map(|(e, s0)| e.into_iter().map(|v| v * s0).collect())
            .collect())
    }

    fn observed_attenuation(&self, scheme: &AcquisitionScheme, data: &SignalMatrix) -> Result<Vec<Vec<f64>>, AppError> {
        if data.n_voxels() != self.n_voxels() {
            return Err(AppError::input(format!(
                "Data has {} voxels, the fit has {}.",
                data.n_voxels(),
                self.n_voxels()
            )));
        }
        let representation = match &self.csd {
            Some(_) => crate::domain::Representation::Full,
            None => self.model.representation(),
        };
        Ok(prepare_signal(scheme, data, representation)?.attenuation)
    }

    /// Mean squared error of the attenuation per voxel.
    pub fn mean_squared_error(&self, scheme: &AcquisitionScheme, data: &SignalMatrix) -> Result<Vec<f64>, AppError> {
        let observed = self.observed_attenuation(scheme, data)?;
        let predicted = self.predicted_attenuation(scheme)?;
        Ok(observed
            .iter()
            .zip(&predicted)
            .map(|(y, yhat)| {
                let n = y.len() as f64;
                y.iter().zip(yhat).map(|(a, b)| (a - b) * (a - b)).sum::<f64>() / n
            })
            .collect())
    }

    /// Coefficient of determination of the attenuation per voxel.
    pub fn r2(&self, scheme: &AcquisitionScheme, data: &SignalMatrix) -> Result<Vec<f64>, AppError> {
        let observed = self.observed_attenuation(scheme, data)?;
        let predicted = self.predicted_attenuation(scheme)?;
        Ok(observed
            .iter()
            .zip(&predicted)
            .map(|(y, yhat)| {
                let mean = y.iter().sum::<f64>() / y.len() as f64;
                let ss_res: f64 = y.iter().zip(yhat).map(|(a, b)| (a - b) * (a - b)).sum();
                let ss_tot: f64 = y.iter().map(|a| (a - mean) * (a - mean)).sum();
                if ss_tot > 0.0 { 1.0 - ss_res / ss_tot } else { f64::NAN }
            })
            .collect())
    }

    /// Signal fractions per voxel, one per compartment.
    pub fn signal_fractions(&self) -> Result<Vec<Vec<f64>>, AppError> {
        let n = self.model.n_compartments();
        let names: Vec<String> = (0..n).map(|i| format!("partial_volume_{i}")).collect();
        if !names.iter().all(|name| self.names.contains(name)) {
            return Ok(vec![vec![1.0]; self.n_voxels()]);
        }
        let columns: Vec<Vec<f64>> = names
            .iter()
            .map(|name| self.fitted_scalar(name))
            .collect::<Result<_, _>>()?;
        Ok((0..self.n_voxels())
            .map(|v| columns.iter().map(|c| c[v]).collect())
            .collect())
    }

    /// Volume fractions per voxel: multi-tissue corrected when S0 responses
    /// are set, otherwise the signal fractions.
    pub fn volume_fractions(&self) -> Result<Vec<Vec<f64>>, AppError> {
        let fractions = self.signal_fractions()?;
        if self.model.s0_responses().is_none() {
            return Ok(fractions);
        }
        Ok(fractions
            .into_iter()
            .zip(&self.success)
            .map(|(f, &ok)| {
                if !ok {
                    return vec![f64::NAN; f.len()];
                }
                self.model
                    .signal_fractions_to_volume_fractions(&f)
                    .unwrap_or_else(|_| vec![f64::NAN; f.len()])
            })
            .collect())
    }

    fn sh_coefficients(&self, voxel: usize) -> Result<(&[f64], usize), AppError> {
        let Some((_, lmax)) = &self.csd else {
            return Err(AppError::input("FODs are only available for CSD fits."));
        };
        let p = self
            .parameters
            .get(voxel)
            .ok_or_else(|| AppError::input(format!("Voxel {voxel} is out of range.")))?;
        let (offset, len) = self.offset_of(SH_COEFF)?;
        Ok((&p[offset..offset + len], *lmax))
    }

    /// FOD amplitudes of one voxel on the given directions.
    pub fn fod(&self, voxel: usize, directions: &[Vector3<f64>]) -> Result<Vec<f64>, AppError> {
        let (coefficients, lmax) = self.sh_coefficients(voxel)?;
        Ok(sh_to_sf(coefficients, lmax, directions))
    }

    pub fn peaks(&self, voxel: usize, options: &PeakOptions) -> Result<Vec<Peak>, AppError> {
        let (coefficients, lmax) = self.sh_coefficients(voxel)?;
        if coefficients.iter().any(|c| !c.is_finite()) {
            return Ok(Vec::new());
        }
        Ok(find_peaks(coefficients, lmax, options))
    }
}
