//! Multi-compartment models and parameter linking.
//!
//! Each compartment contributes its parameters under the prefix
//! `<Model>_<k>_` where `k` counts repeats of the same model from 1. With more
//! than one compartment, `partial_volume_<i>` fractions follow.
//!
//! The *full vector* concatenates every parameter component in that order.
//! Links (fixed, equal, tortuous) remove parameters from the *optimized
//! vector*; `expand` rebuilds the full vector from the optimized one by
//! resolving links in dependency order.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::Range;

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use crate::acquisition::AcquisitionScheme;
use crate::domain::{ParameterInfo, Representation};
use crate::error::AppError;
use crate::models::compartment::Compartment;

/// A parameter link as configured by the user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParameterLink {
    /// Fixed physical values (one per component).
    Fixed(Vec<f64>),
    /// Same value as another parameter.
    Equal(String),
    /// `λ⊥ = λ∥ · vf_extra / (vf_intra + vf_extra)`.
    Tortuous {
        lambda_par: String,
        vf_intra: String,
        vf_extra: String,
    },
}

/// Link with parameter indices resolved.
#[derive(Debug, Clone, PartialEq)]
enum Link {
    Fixed(Vec<f64>),
    Equal(usize),
    Tortuous { lambda_par: usize, vf_intra: usize, vf_extra: usize },
}

impl Link {
    fn dependencies(&self) -> Vec<usize> {
        match self {
            Link::Fixed(_) => Vec::new(),
            Link::Equal(source) => vec![*source],
            Link::Tortuous {
                lambda_par,
                vf_intra,
                vf_extra,
            } => vec![*lambda_par, *vf_intra, *vf_extra],
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MultiCompartmentModel {
    compartments: Vec<Compartment>,
    representation: Representation,
    parameters: Vec<ParameterInfo>,
    offsets: Vec<usize>,
    full_len: usize,
    compartment_ranges: Vec<Range<usize>>,
    fraction_slots: Vec<usize>,
    /// Links in resolution order.
    links: Vec<(usize, Link)>,
    s0_responses: Option<Vec<f64>>,
}

impl MultiCompartmentModel {
    pub fn new(compartments: Vec<Compartment>) -> Result<Self, AppError> {
        Self::with_representation(compartments, Representation::Full)
    }

    pub fn with_representation(
        compartments: Vec<Compartment>,
        representation: Representation,
    ) -> Result<Self, AppError> {
        if compartments.is_empty() {
            return Err(AppError::input("A multi-compartment model needs at least one compartment."));
        }

        let mut counts: HashMap<&'static str, usize> = HashMap::new();
        let mut parameters = Vec::new();
        let mut offsets = Vec::new();
        let mut compartment_ranges = Vec::with_capacity(compartments.len());
        let mut offset = 0;
        for compartment in &compartments {
            let count = counts.entry(compartment.model_name()).or_insert(0);
            *count += 1;
            let start = offset;
            for p in compartment.parameters(representation) {
                offsets.push(offset);
                offset += p.cardinality;
                parameters.push(p.renamed(format!("{}_{}_{}", compartment.model_name(), count, p.name)));
            }
            compartment_ranges.push(start..offset);
        }

        let mut fraction_slots = Vec::new();
        if compartments.len() > 1 {
            for i in 0..compartments.len() {
                fraction_slots.push(parameters.len());
                offsets.push(offset);
                offset += 1;
                parameters.push(ParameterInfo::fraction(format!("partial_volume_{i}")));
            }
        }

        Ok(Self {
            compartments,
            representation,
            parameters,
            offsets,
            full_len: offset,
            compartment_ranges,
            fraction_slots,
            links: Vec::new(),
            s0_responses: None,
        })
    }

    pub fn compartments(&self) -> &[Compartment] {
        &self.compartments
    }

    pub fn n_compartments(&self) -> usize {
        self.compartments.len()
    }

    pub fn representation(&self) -> Representation {
        self.representation
    }

    pub fn parameters(&self) -> &[ParameterInfo] {
        &self.parameters
    }

    pub fn parameter_names(&self) -> Vec<String> {
        self.parameters.iter().map(|p| p.name.clone()).collect()
    }

    pub fn full_len(&self) -> usize {
        self.full_len
    }

    fn index_of(&self, name: &str) -> Result<usize, AppError> {
        self.parameters
            .iter()
            .position(|p| p.name == name)
            .ok_or_else(|| {
                AppError::input(format!(
                    "Unknown parameter '{name}'. Known parameters: {}.",
                    self.parameter_names().join(", ")
                ))
            })
    }

    fn range_of(&self, index: usize) -> Range<usize> {
        let start = self.offsets[index];
        start..start + self.parameters[index].cardinality
    }

    pub fn parameter_cardinality(&self, name: &str) -> Result<usize, AppError> {
        Ok(self.parameters[self.index_of(name)?].cardinality)
    }

    /// Position of a parameter inside the full vector.
    pub fn parameter_range(&self, name: &str) -> Result<Range<usize>, AppError> {
        Ok(self.range_of(self.index_of(name)?))
    }

    fn is_linked_index(&self, index: usize) -> bool {
        self.links.iter().any(|(t, _)| *t == index)
    }

    pub fn is_linked(&self, name: &str) -> bool {
        self.index_of(name).is_ok_and(|i| self.is_linked_index(i))
    }

    /// Whether `name` is one of the model-level `partial_volume_<i>`.
    pub fn is_partial_volume(&self, name: &str) -> bool {
        self.index_of(name).is_ok_and(|i| self.fraction_slots.contains(&i))
    }

    /// Share of the unit simplex left to the free partial volumes, `1 - Σ` of
    /// the fixed ones. `None` without free partial volumes, or when one
    /// follows a link other than a fixed value.
    pub fn free_fraction_budget(&self) -> Option<f64> {
        let mut fixed = 0.0;
        let mut free = 0;
        for &slot in &self.fraction_slots {
            match self.links.iter().find(|(t, _)| *t == slot) {
                None => free += 1,
                Some((_, Link::Fixed(values))) => fixed += values[0],
                Some(_) => return None,
            }
        }
        (free > 0 && fixed <= 1.0).then_some(1.0 - fixed)
    }

    /// Full-vector positions of the partial volumes that are not linked.
    pub fn free_fraction_positions(&self) -> Vec<usize> {
        self.fraction_slots
            .iter()
            .filter(|&&slot| !self.is_linked_index(slot))
            .map(|&slot| self.offsets[slot])
            .collect()
    }

    /// Parameters that remain in the optimized vector.
    pub fn optimized_parameters(&self) -> Vec<&ParameterInfo> {
        self.parameters
            .iter()
            .enumerate()
            .filter(|(i, _)| !self.is_linked_index(*i))
            .map(|(_, p)| p)
            .collect()
    }

    pub fn optimized_parameter_names(&self) -> Vec<String> {
        self.optimized_parameters().into_iter().map(|p| p.name.clone()).collect()
    }

    pub fn optimized_len(&self) -> usize {
        self.optimized_parameters().iter().map(|p| p.cardinality).sum()
    }

    /// Scaled optimisation bounds of the optimized vector, one pair per component.
    pub fn bounds(&self) -> Vec<(f64, f64)> {
        self.optimized_parameters()
            .into_iter()
            .flat_map(|p| p.bounds.iter().copied())
            .collect()
    }

    /// Physical scale of each optimized component.
    pub fn scales(&self) -> Vec<f64> {
        self.optimized_parameters()
            .into_iter()
            .flat_map(|p| std::iter::repeat_n(p.scale, p.cardinality))
            .collect()
    }

    /// Configured links by target name, in resolution order.
    pub fn links(&self) -> Vec<(String, ParameterLink)> {
        let name = |i: usize| self.parameters[i].name.clone();
        self.links
            .iter()
            .map(|(target, link)| {
                let public = match link {
                    Link::Fixed(values) => ParameterLink::Fixed(values.clone()),
                    Link::Equal(source) => ParameterLink::Equal(name(*source)),
                    Link::Tortuous {
                        lambda_par,
                        vf_intra,
                        vf_extra,
                    } => ParameterLink::Tortuous {
                        lambda_par: name(*lambda_par),
                        vf_intra: name(*vf_intra),
                        vf_extra: name(*vf_extra),
                    },
                };
                (name(*target), public)
            })
            .collect()
    }

    /// Whether any fraction is linked or any link reads a fraction.
    pub fn links_involve_fractions(&self) -> bool {
        self.links.iter().any(|(target, link)| {
            self.fraction_slots.contains(target)
                || link.dependencies().iter().any(|d| self.fraction_slots.contains(d))
        })
    }

    pub fn set_fixed_parameter(&mut self, name: &str, values: Vec<f64>) -> Result<(), AppError> {
        let index = self.index_of(name)?;
        let cardinality = self.parameters[index].cardinality;
        if values.len() != cardinality {
            return Err(AppError::input(format!(
                "Parameter '{name}' has cardinality {cardinality}, got {} values.",
                values.len()
            )));
        }
        if values.iter().any(|v| !v.is_finite()) {
            return Err(AppError::input(format!("Fixed value of '{name}' must be finite.")));
        }
        self.insert_link(index, Link::Fixed(values))
    }

    pub fn set_equal_parameter(&mut self, target: &str, source: &str) -> Result<(), AppError> {
        let t = self.index_of(target)?;
        let s = self.index_of(source)?;
        if t == s {
            return Err(AppError::input(format!("Parameter '{target}' cannot be linked to itself.")));
        }
        if self.parameters[t].cardinality != self.parameters[s].cardinality {
            return Err(AppError::input(format!(
                "Cannot link '{target}' to '{source}': cardinalities differ."
            )));
        }
        self.insert_link(t, Link::Equal(s))
    }

    pub fn set_tortuous_parameter(
        &mut self,
        lambda_perp: &str,
        lambda_par: &str,
        vf_intra: &str,
        vf_extra: &str,
    ) -> Result<(), AppError> {
        let target = self.index_of(lambda_perp)?;
        let deps = [self.index_of(lambda_par)?, self.index_of(vf_intra)?, self.index_of(vf_extra)?];
        if deps.contains(&target) {
            return Err(AppError::input(format!("Parameter '{lambda_perp}' cannot depend on itself.")));
        }
        for &i in std::iter::once(&target).chain(&deps) {
            if self.parameters[i].cardinality != 1 {
                return Err(AppError::input(format!(
                    "Tortuosity links need scalar parameters; '{}' is not.",
                    self.parameters[i].name
                )));
            }
        }
        self.insert_link(
            target,
            Link::Tortuous {
                lambda_par: deps[0],
                vf_intra: deps[1],
                vf_extra: deps[2],
            },
        )
    }

    /// Override optimisation bounds (scaled units, one pair per component).
    pub fn set_parameter_optimization_bounds(
        &mut self,
        name: &str,
        bounds: Vec<(f64, f64)>,
    ) -> Result<(), AppError> {
        let index = self.index_of(name)?;
        let p = &mut self.parameters[index];
        if bounds.len() != p.cardinality {
            return Err(AppError::input(format!(
                "Parameter '{name}' needs {} bound pairs, got {}.",
                p.cardinality,
                bounds.len()
            )));
        }
        if bounds.iter().any(|(lo, hi)| !(lo.is_finite() && hi.is_finite() && lo <= hi)) {
            return Err(AppError::input(format!("Bounds of '{name}' must be finite with lo <= hi.")));
        }
        p.bounds = bounds;
        Ok(())
    }

    /// One S0 response per compartment for multi-tissue models.
    pub fn set_s0_responses(&mut self, responses: Vec<f64>) -> Result<(), AppError> {
        if responses.len() != self.compartments.len() {
            return Err(AppError::input(format!(
                "Expected {} S0 responses, got {}.",
                self.compartments.len(),
                responses.len()
            )));
        }
        if responses.iter().any(|s| !(s.is_finite() && *s > 0.0)) {
            return Err(AppError::input("S0 responses must be finite and > 0."));
        }
        self.s0_responses = Some(responses);
        Ok(())
    }

    pub fn s0_responses(&self) -> Option<&[f64]> {
        self.s0_responses.as_deref()
    }

    fn insert_link(&mut self, target: usize, link: Link) -> Result<(), AppError> {
        let mut candidate: Vec<(usize, Link)> =
            self.links.iter().filter(|(t, _)| *t != target).cloned().collect();
        candidate.push((target, link));
        self.links = self.order_links(candidate)?;
        Ok(())
    }

    /// Order links so every dependency resolves before its dependents.
    fn order_links(&self, links: Vec<(usize, Link)>) -> Result<Vec<(usize, Link)>, AppError> {
        let linked: HashSet<usize> = links.iter().map(|(t, _)| *t).collect();
        let mut resolved: HashSet<usize> = HashSet::new();
        let mut pending = links;
        let mut ordered = Vec::with_capacity(pending.len());

        while !pending.is_empty() {
            let before = pending.len();
            let mut rest = Vec::new();
            for (target, link) in pending {
                let ready = link
                    .dependencies()
                    .iter()
                    .all(|d| !linked.contains(d) || resolved.contains(d));
                if ready {
                    resolved.insert(target);
                    ordered.push((target, link));
                } else {
                    rest.push((target, link));
                }
            }
            if rest.len() == before {
                let names: Vec<&str> = rest.iter().map(|(t, _)| self.parameters[*t].name.as_str()).collect();
                return Err(AppError::input(format!(
                    "Parameter links form a cycle involving: {}.",
                    names.join(", ")
                )));
            }
            pending = rest;
        }
        Ok(ordered)
    }

    /// Full vector from an optimized vector.
    pub fn expand(&self, optimized: &[f64]) -> Result<Vec<f64>, AppError> {
        let expected = self.optimized_len();
        if optimized.len() != expected {
            return Err(AppError::input(format!(
                "Optimized vector has {} entries, expected {expected}.",
                optimized.len()
            )));
        }
        let mut full = vec![0.0; self.full_len];
        let mut k = 0;
        for i in 0..self.parameters.len() {
            if self.is_linked_index(i) {
                continue;
            }
            let range = self.range_of(i);
            let len = range.len();
            full[range].copy_from_slice(&optimized[k..k + len]);
            k += len;
        }
        self.constrain_compartments(&mut full);
        for (target, link) in &self.links {
            let range = self.range_of(*target);
            match link {
                Link::Fixed(values) => full[range].copy_from_slice(values),
                Link::Equal(source) => {
                    let values = full[self.range_of(*source)].to_vec();
                    full[range].copy_from_slice(&values);
                }
                Link::Tortuous {
                    lambda_par,
                    vf_intra,
                    vf_extra,
                } => {
                    let lpar = full[self.offsets[*lambda_par]];
                    let intra = full[self.offsets[*vf_intra]];
                    let extra = full[self.offsets[*vf_extra]];
                    let total = intra + extra;
                    full[range.start] = if total > 0.0 { lpar * extra / total } else { lpar };
                }
            }
        }
        if !self.links.is_empty() {
            self.constrain_compartments(&mut full);
        }
        Ok(full)
    }

    /// Runs before links resolve, so links read effective values, and again
    /// after, in case a link targets a constrained parameter.
    fn constrain_compartments(&self, full: &mut [f64]) {
        for (compartment, range) in self.compartments.iter().zip(&self.compartment_ranges) {
            compartment.constrain(&mut full[range.clone()], self.representation);
        }
    }

    /// Optimized vector extracted from a full vector.
    pub fn compress(&self, full: &[f64]) -> Result<Vec<f64>, AppError> {
        self.check_full_len(full)?;
        let mut out = Vec::with_capacity(self.optimized_len());
        for i in 0..self.parameters.len() {
            if !self.is_linked_index(i) {
                out.extend_from_slice(&full[self.range_of(i)]);
            }
        }
        Ok(out)
    }

    fn check_full_len(&self, full: &[f64]) -> Result<(), AppError> {
        if full.len() != self.full_len {
            return Err(AppError::input(format!(
                "Parameter vector has {} entries, expected {}.",
                full.len(),
                self.full_len
            )));
        }
        Ok(())
    }

    /// Full vector from named values. Every optimized parameter is required;
    /// linked parameters are always derived from their links.
    pub fn parameters_to_vector(&self, values: &BTreeMap<String, Vec<f64>>) -> Result<Vec<f64>, AppError> {
        let mut optimized = Vec::with_capacity(self.optimized_len());
        for p in self.optimized_parameters() {
            let v = values
                .get(&p.name)
                .ok_or_else(|| AppError::input(format!("Missing value for parameter '{}'.", p.name)))?;
            if v.len() != p.cardinality {
                return Err(AppError::input(format!(
                    "Parameter '{}' has cardinality {}, got {} values.",
                    p.name,
                    p.cardinality,
                    v.len()
                )));
            }
            optimized.extend_from_slice(v);
        }
        self.expand(&optimized)
    }

    pub fn vector_to_parameters(&self, full: &[f64]) -> Result<BTreeMap<String, Vec<f64>>, AppError> {
        self.check_full_len(full)?;
        Ok(self
            .parameters
            .iter()
            .enumerate()
            .map(|(i, p)| (p.name.clone(), full[self.range_of(i)].to_vec()))
            .collect())
    }

    /// Fraction of every compartment (`[1.0]` for a single compartment).
    pub fn fractions(&self, full: &[f64]) -> Vec<f64> {
        if self.fraction_slots.is_empty() {
            vec![1.0]
        } else {
            self.fraction_slots.iter().map(|&i| full[self.offsets[i]]).collect()
        }
    }

    /// Parameter slice of compartment `i` inside a full vector.
    pub fn compartment_parameters<'a>(&self, full: &'a [f64], i: usize) -> &'a [f64] {
        &full[self.compartment_ranges[i].clone()]
    }

    pub fn compartment_range(&self, i: usize) -> Range<usize> {
        self.compartment_ranges[i].clone()
    }

    pub fn requires_qvalues(&self) -> bool {
        self.compartments.iter().any(Compartment::requires_qvalues)
    }

    /// Reject schemes the compartments cannot be evaluated on.
    pub fn check_scheme(&self, scheme: &AcquisitionScheme) -> Result<(), AppError> {
        if self.requires_qvalues() && scheme.qvalues().is_none() {
            return Err(AppError::input(
                "The model contains restricted compartments that need q-values; \
                 provide delta and big_delta for the acquisition scheme.",
            ));
        }
        Ok(())
    }

    /// Signal length: measurements, or shells for spherical means.
    pub fn signal_len(&self, scheme: &AcquisitionScheme) -> usize {
        match self.representation {
            Representation::Full => scheme.n_measurements(),
            Representation::SphericalMean => scheme.shells().len(),
        }
    }

    /// One column per compartment, each with unit fraction.
    pub fn compartment_signals(&self, scheme: &AcquisitionScheme, full: &[f64]) -> Result<DMatrix<f64>, AppError> {
        self.check_full_len(full)?;
        self.check_scheme(scheme)?;
        let rows = self.signal_len(scheme);
        let mut out = DMatrix::zeros(rows, self.compartments.len());
        for (j, compartment) in self.compartments.iter().enumerate() {
            let signal = compartment.signal(scheme, self.compartment_parameters(full, j), self.representation);
            for (r, v) in signal.into_iter().enumerate() {
                out[(r, j)] = v;
            }
        }
        Ok(out)
    }

    /// Attenuation `Σ f_i E_i`.
    pub fn simulate_signal(&self, scheme: &AcquisitionScheme, full: &[f64]) -> Result<Vec<f64>, AppError> {
        let columns = self.compartment_signals(scheme, full)?;
        let fractions = self.fractions(full);
        Ok(weighted_rows(&columns, &fractions))
    }

    /// Raw signal `Σ vf_i S0_i E_i`, with the fractions in `full` read as
    /// volume fractions.
    pub fn simulate_multi_tissue_signal(
        &self,
        scheme: &AcquisitionScheme,
        full: &[f64],
    ) -> Result<Vec<f64>, AppError> {
        let Some(s0) = &self.s0_responses else {
            return Err(AppError::input("Multi-tissue simulation needs S0 responses."));
        };
        let columns = self.compartment_signals(scheme, full)?;
        let weights: Vec<f64> = self.fractions(full).iter().zip(s0).map(|(f, s)| f * s).collect();
        Ok(weighted_rows(&columns, &weights))
    }

    /// `vf_i = (sf_i / S0_i) / Σ_j (sf_j / S0_j)`.
    pub fn signal_fractions_to_volume_fractions(&self, signal_fractions: &[f64]) -> Result<Vec<f64>, AppError> {
        let Some(s0) = &self.s0_responses else {
            return Err(AppError::input("Volume fractions need S0 responses."));
        };
        if signal_fractions.len() != s0.len() {
            return Err(AppError::input("One signal fraction per compartment is required."));
        }
        let raw: Vec<f64> = signal_fractions.iter().zip(s0).map(|(f, s)| f / s).collect();
        let total: f64 = raw.iter().sum();
        if !(total > 0.0 && total.is_finite()) {
            return Err(AppError::numeric("Signal fractions sum to zero; volume fractions are undefined."));
        }
        Ok(raw.into_iter().map(|v| v / total).collect())
    }
}

fn weighted_rows(columns: &DMatrix<f64>, weights: &[f64]) -> Vec<f64> {
    (0..columns.nrows())
        .map(|r| weights.iter().enumerate().map(|(j, w)| w * columns[(r, j)]).sum())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::presets::hcp_like;

    fn stick_zeppelin_ball() -> MultiCompartmentModel {
        MultiCompartmentModel::new(vec![Compartment::stick(), Compartment::zeppelin(), Compartment::Ball]).unwrap()
    }

    #[test]
    fn names_follow_model_prefixes() {
        let mc = MultiCompartmentModel::new(vec![Compartment::stick(), Compartment::stick(), Compartment::Ball])
            .unwrap();
        assert_eq!(
            mc.parameter_names(),
            vec![
                "C1Stick_1_mu",
                "C1Stick_1_lambda_par",
                "C1Stick_2_mu",
                "C1Stick_2_lambda_par",
                "G1Ball_1_lambda_iso",
                "partial_volume_0",
                "partial_volume_1",
                "partial_volume_2",
            ]
        );
        assert_eq!(mc.full_len(), 2 + 1 + 2 + 1 + 1 + 3);
        assert_eq!(mc.parameter_cardinality("C1Stick_2_mu").unwrap(), 2);
    }

    #[test]
    fn single_compartment_has_no_fractions() {
        let mc = MultiCompartmentModel::new(vec![Compartment::Ball]).unwrap();
        assert_eq!(mc.parameter_names(), vec!["G1Ball_1_lambda_iso"]);
        assert_eq!(mc.fractions(&[1e-9]), vec![1.0]);
    }

    #[test]
    fn links_leave_the_optimized_vector() {
        let mut mc = stick_zeppelin_ball();
        mc.set_fixed_parameter("G1Ball_1_lambda_iso", vec![3e-9]).unwrap();
        mc.set_equal_parameter("G2Zeppelin_1_mu", "C1Stick_1_mu").unwrap();
        mc.set_equal_parameter("G2Zeppelin_1_lambda_par", "C1Stick_1_lambda_par").unwrap();
        mc.set_tortuous_parameter(
            "G2Zeppelin_1_lambda_perp",
            "C1Stick_1_lambda_par",
            "partial_volume_0",
            "partial_volume_1",
        )
        .unwrap();
        assert_eq!(
            mc.optimized_parameter_names(),
            vec!["C1Stick_1_mu", "C1Stick_1_lambda_par", "partial_volume_0", "partial_volume_1", "partial_volume_2"]
        );

        let full = mc.expand(&[0.5, 1.0, 2e-9, 0.6, 0.2, 0.2]).unwrap();
        let named = mc.vector_to_parameters(&full).unwrap();
        assert_eq!(named["G2Zeppelin_1_mu"], vec![0.5, 1.0]);
        assert_eq!(named["G2Zeppelin_1_lambda_par"], vec![2e-9]);
        assert_eq!(named["G1Ball_1_lambda_iso"], vec![3e-9]);
        let perp = named["G2Zeppelin_1_lambda_perp"][0];
        assert!((perp - 2e-9 * 0.2 / 0.8).abs() < 1e-20);
        assert!(mc.links_involve_fractions());
        assert_eq!(mc.compress(&full).unwrap(), vec![0.5, 1.0, 2e-9, 0.6, 0.2, 0.2]);
        assert_eq!(mc.bounds().len(), mc.optimized_len());
        assert_eq!(mc.scales(), vec![1.0, 1.0, 1e-9, 1.0, 1.0, 1.0]);
    }

    #[test]
    fn chained_links_resolve_in_dependency_order() {
        let mut mc = stick_zeppelin_ball();
        // Registered before its source is itself linked.
        mc.set_equal_parameter("G2Zeppelin_1_lambda_perp", "G1Ball_1_lambda_iso").unwrap();
        mc.set_equal_parameter("G1Ball_1_lambda_iso", "C1Stick_1_lambda_par").unwrap();
        let opt = vec![0.1, 0.2, 1.5e-9, 0.3, 0.4, 2.0e-9, 0.5, 0.3, 0.2];
        let full = mc.expand(&opt).unwrap();
        let named = mc.vector_to_parameters(&full).unwrap();
        assert_eq!(named["G2Zeppelin_1_lambda_perp"], vec![1.5e-9]);
    }

    #[test]
    fn cycles_and_bad_links_are_rejected() {
        let mut mc = stick_zeppelin_ball();
        mc.set_equal_parameter("G2Zeppelin_1_lambda_par", "C1Stick_1_lambda_par").unwrap();
        let err = mc
            .set_equal_parameter("C1Stick_1_lambda_par", "G2Zeppelin_1_lambda_par")
            .unwrap_err();
        assert!(err.message().contains("cycle"));
        // The rejected link left the previous configuration intact.
        assert_eq!(mc.links().len(), 1);

        assert!(mc.set_equal_parameter("C1Stick_1_mu", "C1Stick_1_lambda_par").is_err());
        assert!(mc.set_fixed_parameter("nope", vec![1.0]).is_err());
        assert!(mc.set_fixed_parameter("C1Stick_1_mu", vec![1.0]).is_err());
    }

    #[test]
    fn simulated_signal_is_fraction_weighted() {
        let scheme = hcp_like().unwrap();
        let mc = MultiCompartmentModel::new(vec![Compartment::stick(), Compartment::Ball]).unwrap();
        let full = vec![0.3, 0.4, 1.7e-9, 3e-9, 0.6, 0.4];
        let signal = mc.simulate_signal(&scheme, &full).unwrap();
        let columns = mc.compartment_signals(&scheme, &full).unwrap();
        for i in 0..scheme.n_measurements() {
            let expected = 0.6 * columns[(i, 0)] + 0.4 * columns[(i, 1)];
            assert!((signal[i] - expected).abs() < 1e-14);
        }
        for &i in &scheme.b0_indices() {
            assert!((signal[i] - 1.0).abs() < 1e-12);
        }
    }

    #[test]
    fn spherical_mean_model_has_one_value_per_shell() {
        let scheme = hcp_like().unwrap();
        let mc = MultiCompartmentModel::with_representation(
            vec![Compartment::stick(), Compartment::Ball],
            Representation::SphericalMean,
        )
        .unwrap();
        assert_eq!(
            mc.parameter_names(),
            vec!["C1Stick_1_lambda_par", "G1Ball_1_lambda_iso", "partial_volume_0", "partial_volume_1"]
        );
        let signal = mc.simulate_signal(&scheme, &[1.7e-9, 3e-9, 0.5, 0.5]).unwrap();
        assert_eq!(signal.len(), 4);
    }

    #[test]
    fn multi_tissue_fraction_conversion() {
        let mut mc = MultiCompartmentModel::new(vec![Compartment::stick(), Compartment::Ball]).unwrap();
        assert!(mc.signal_fractions_to_volume_fractions(&[0.5, 0.5]).is_err());
        mc.set_s0_responses(vec![1000.0, 3000.0]).unwrap();
        let vf = mc.signal_fractions_to_volume_fractions(&[0.5, 0.5]).unwrap();
        assert!((vf[0] - 0.75).abs() < 1e-12);
        assert!((vf[1] - 0.25).abs() < 1e-12);

        let scheme = hcp_like().unwrap();
        let raw = mc.simulate_multi_tissue_signal(&scheme, &[0.0, 0.0, 1.7e-9, 3e-9, 0.75, 0.25]).unwrap();
        let b0 = scheme.b0_indices()[0];
        assert!((raw[b0] - (0.75 * 1000.0 + 0.25 * 3000.0)).abs() < 1e-9);
    }

    #[test]
    fn parameters_to_vector_requires_optimized_values() {
        let mut mc = MultiCompartmentModel::new(vec![Compartment::stick(), Compartment::Ball]).unwrap();
        mc.set_fixed_parameter("G1Ball_1_lambda_iso", vec![3e-9]).unwrap();
        let mut values = BTreeMap::new();
        values.insert("C1Stick_1_mu".to_string(), vec![0.0, 0.0]);
        values.insert("C1Stick_1_lambda_par".to_string(), vec![1.7e-9]);
        values.insert("partial_volume_0".to_string(), vec![0.7]);
        assert!(mc.parameters_to_vector(&values).is_err());
        values.insert("partial_volume_1".to_string(), vec![0.3]);
        let full = mc.parameters_to_vector(&values).unwrap();
        assert_eq!(full, vec![0.0, 0.0, 1.7e-9, 3e-9, 0.7, 0.3]);
    }

    #[test]
    fn cylinder_needs_qvalues() {
        let mc = MultiCompartmentModel::new(vec![Compartment::cylinder()]).unwrap();
        let scheme = crate::acquisition::presets::multi_shell(&[1000.0], 10, 1, None, None, None).unwrap();
        assert!(mc.check_scheme(&scheme).is_err());
        assert!(mc.simulate_signal(&scheme, &[0.0, 0.0, 1.7e-9, 4e-6]).is_err());
    }

    #[test]
    fn fraction_budget_follows_fixed_links() {
        let mut mc = stick_zeppelin_ball();
        assert_eq!(mc.free_fraction_budget(), Some(1.0));
        mc.set_fixed_parameter("partial_volume_2", vec![0.25]).unwrap();
        assert_eq!(mc.free_fraction_budget(), Some(0.75));
        assert_eq!(mc.free_fraction_positions().len(), 2);
        mc.set_equal_parameter("partial_volume_1", "partial_volume_0").unwrap();
        assert_eq!(mc.free_fraction_budget(), None);
        assert!(MultiCompartmentModel::new(vec![Compartment::Ball]).unwrap().free_fraction_budget().is_none());
    }

    #[test]
    fn expand_carries_effective_bingham_beta() {
        let bingham = Compartment::bingham(vec![crate::domain::KernelKind::Stick]).unwrap();
        let mc = MultiCompartmentModel::new(vec![bingham]).unwrap();
        let full = mc.expand(&[0.4, 1.0, 0.3, 2.0, 9.0, 1.7e-9]).unwrap();
        let beta = full[mc.parameter_range("SD2BinghamDistributed_1_beta").unwrap().start];
        let kappa = full[mc.parameter_range("SD2BinghamDistributed_1_kappa").unwrap().start];
        assert_eq!(beta, kappa);
    }
}
