//! Atomic dataset consumed by the transport core.
//!
//! All tables are created once at startup by the ingest stage and are only
//! ever read during propagation. The line list is sorted by descending
//! rest-frame frequency, the photoionization list by ascending threshold
//! frequency; both orderings are validated on construction because the
//! resonance search and the bound-free opacity walk rely on them.

use crate::{
    constants::{HPLANCK, KBOLTZMANN, SAHACONST},
    packets::fpk,
};

/// A single atomic level.
#[derive(Clone, Debug)]
pub struct Level {
    /// Statistical weight g of the level.
    pub stat_weight: fpk,
}

/// A single ionization stage of an element.
#[derive(Clone, Debug)]
pub struct Ion {
    /// Ionization stage, with 1 denoting the neutral atom.
    pub ion_stage: u32,
    /// Levels of this ion, ground state first.
    pub levels: Vec<Level>,
}

/// A single element of the composition.
#[derive(Clone, Debug)]
pub struct Element {
    /// Nuclear charge Z.
    pub atomic_number: u32,
    /// Ionization stages included in the dataset, lowest first.
    pub ions: Vec<Ion>,
}

/// A bound-bound transition in the sorted line list.
#[derive(Clone, Debug)]
pub struct Line {
    /// Rest-frame frequency of the transition [Hz].
    pub nu: fpk,
    /// Einstein coefficient for spontaneous emission [1/s].
    pub einstein_a: fpk,
    /// Absorption oscillator strength.
    pub osc_strength: fpk,
    /// Collision strength.
    pub coll_str: fpk,
    /// Whether the transition is forbidden.
    pub forbidden: bool,
    /// Index of the element in the dataset.
    pub element: usize,
    /// Index of the ion within the element.
    pub ion: usize,
    /// Index of the upper level within the ion.
    pub upper: usize,
    /// Index of the lower level within the ion.
    pub lower: usize,
}

/// A photoionization continuum with its sampled cross-section table.
///
/// The table holds the cross-section at frequencies
/// `nu_edge * (1 + k * nu_step)` for `k = 0, ..., len - 1`.
#[derive(Clone, Debug)]
pub struct PhotoionContinuum {
    /// Index of the element in the dataset.
    pub element: usize,
    /// Index of the lower ion within the element.
    pub ion: usize,
    /// Index of the level of the lower ion being ionized.
    pub level: usize,
    /// Which of the level's photoionization targets this continuum is.
    pub phixstargetindex: usize,
    /// Index of the target level in the upper ion.
    pub upper_level: usize,
    /// Threshold frequency [Hz].
    pub nu_edge: fpk,
    /// Probability of ending up in `upper_level` after photoionization.
    pub probability: fpk,
    /// Sampled cross-sections [cm^2].
    pub cross_sections: Vec<fpk>,
    /// Table step in units of `nu / nu_edge - 1`.
    pub nu_step: fpk,
}

impl PhotoionContinuum {
    /// Frequency of the uppermost point in the cross-section table [Hz].
    pub fn nu_max(&self) -> fpk {
        self.nu_edge * (1.0 + (self.cross_sections.len() - 1) as fpk * self.nu_step)
    }

    /// Interpolates the cross-section at the given frequency [cm^2].
    ///
    /// Linear between table points; a nu^-3 power law above the table.
    pub fn cross_section_at(&self, nu: fpk) -> fpk {
        let ireal = (nu / self.nu_edge - 1.0) / self.nu_step;
        if ireal < 0.0 {
            return 0.0;
        }
        let i = ireal as usize;
        if i + 1 < self.cross_sections.len() {
            self.cross_sections[i]
                + (self.cross_sections[i + 1] - self.cross_sections[i]) * (ireal - i as fpk)
        } else {
            let sigma_top = self.cross_sections[self.cross_sections.len() - 1];
            sigma_top * (self.nu_max() / nu).powi(3)
        }
    }
}

/// A ground-state photoionization channel, used by the volume estimators.
#[derive(Clone, Debug)]
pub struct GroundContinuum {
    /// Index of the element in the dataset.
    pub element: usize,
    /// Index of the lower ion within the element.
    pub ion: usize,
    /// Threshold frequency [Hz].
    pub nu_edge: fpk,
    /// Index of the full continuum entry this channel was derived from.
    pub continuum_index: usize,
}

/// The complete immutable atomic dataset.
#[derive(Clone, Debug)]
pub struct AtomicData {
    elements: Vec<Element>,
    linelist: Vec<Line>,
    continua: Vec<PhotoionContinuum>,
    continuum_ground_index: Vec<Option<usize>>,
    ground_continua: Vec<GroundContinuum>,
}

impl AtomicData {
    /// Assembles a dataset, validating the orderings the core relies on.
    pub fn new(elements: Vec<Element>, linelist: Vec<Line>, continua: Vec<PhotoionContinuum>) -> Self {
        for window in linelist.windows(2) {
            crate::fatal_unless!(
                window[0].nu >= window[1].nu,
                "line list is not sorted by descending frequency ({} before {})",
                window[0].nu,
                window[1].nu
            );
        }
        for window in continua.windows(2) {
            crate::fatal_unless!(
                window[0].nu_edge <= window[1].nu_edge,
                "photoionization list is not sorted by ascending threshold ({} before {})",
                window[0].nu_edge,
                window[1].nu_edge
            );
        }
        for line in &linelist {
            let nlevels = elements[line.element].ions[line.ion].levels.len();
            crate::fatal_unless!(
                line.upper < nlevels && line.lower < line.upper,
                "line at nu {} references invalid levels {} -> {}",
                line.nu,
                line.lower,
                line.upper
            );
        }

        let mut continuum_ground_index = vec![None; continua.len()];
        let mut ground_continua = Vec::new();
        for (i, cont) in continua.iter().enumerate() {
            if cont.level == 0 {
                continuum_ground_index[i] = Some(ground_continua.len());
                ground_continua.push(GroundContinuum {
                    element: cont.element,
                    ion: cont.ion,
                    nu_edge: cont.nu_edge,
                    continuum_index: i,
                });
            }
        }

        Self {
            elements,
            linelist,
            continua,
            continuum_ground_index,
            ground_continua,
        }
    }

    /// Returns the number of elements in the dataset.
    pub fn n_elements(&self) -> usize {
        self.elements.len()
    }

    /// Returns the number of ions of the given element.
    pub fn n_ions(&self, element: usize) -> usize {
        self.elements[element].ions.len()
    }

    /// Returns the largest ion count over all elements.
    pub fn max_n_ions(&self) -> usize {
        self.elements
            .iter()
            .map(|element| element.ions.len())
            .max()
            .unwrap_or(0)
    }

    /// Returns the ionization stage of the given ion (1 = neutral).
    pub fn ion_stage(&self, element: usize, ion: usize) -> u32 {
        self.elements[element].ions[ion].ion_stage
    }

    /// Returns the number of levels of the given ion.
    pub fn n_levels(&self, element: usize, ion: usize) -> usize {
        self.elements[element].ions[ion].levels.len()
    }

    /// Returns the statistical weight of the given level.
    pub fn stat_weight(&self, element: usize, ion: usize, level: usize) -> fpk {
        self.elements[element].ions[ion].levels[level].stat_weight
    }

    /// Returns the number of lines in the sorted line list.
    pub fn n_lines(&self) -> usize {
        self.linelist.len()
    }

    /// Returns the line at the given index of the sorted line list.
    pub fn line(&self, lineindex: usize) -> &Line {
        &self.linelist[lineindex]
    }

    /// Returns the Einstein A coefficient of the given line [1/s].
    pub fn einstein_a(&self, lineindex: usize) -> fpk {
        self.linelist[lineindex].einstein_a
    }

    /// Returns the number of photoionization continua.
    pub fn n_continua(&self) -> usize {
        self.continua.len()
    }

    /// Returns the photoionization continuum at the given index.
    pub fn continuum(&self, index: usize) -> &PhotoionContinuum {
        &self.continua[index]
    }

    /// Returns the index into the ground-channel list for the given
    /// continuum, if it photoionizes from a ground state.
    pub fn continuum_ground_index(&self, index: usize) -> Option<usize> {
        self.continuum_ground_index[index]
    }

    /// Returns the ground-state photoionization channels, sorted by
    /// ascending threshold frequency.
    pub fn ground_continua(&self) -> &[GroundContinuum] {
        &self.ground_continua
    }

    /// Computes the Saha factor linking the populations of a level and a
    /// level of the next-higher ion at the given electron temperature and
    /// threshold frequency.
    pub fn saha_factor(
        &self,
        element: usize,
        ion: usize,
        lower_level: usize,
        upper_level: usize,
        t_e: fpk,
        nu_threshold: fpk,
    ) -> fpk {
        let g_lower = self.stat_weight(element, ion, lower_level);
        let g_upper = self.stat_weight(element, ion + 1, upper_level);
        let e_threshold = HPLANCK * nu_threshold;
        SAHACONST * g_lower / g_upper
            * t_e.powf(-1.5)
            * (e_threshold / (KBOLTZMANN * t_e)).exp()
    }

    /// Finds the next candidate resonance at or redward of `nu_cmf` for a
    /// packet propagating through a non-empty cell.
    ///
    /// `next_trans` is the packet's running position in the line list: 0
    /// means the position is unknown and must be searched for, any larger
    /// value is trusted even if `nu_cmf` has drifted slightly past the line
    /// it names, because a re-search could make the packet scatter twice in
    /// the same line. Returns `None` when no line interaction remains
    /// possible.
    pub fn closest_transition(&self, nu_cmf: fpk, next_trans: usize) -> Option<usize> {
        let nlines = self.linelist.len();
        if nlines == 0 || nu_cmf < self.linelist[nlines - 1].nu {
            return None;
        }
        if next_trans > nlines - 1 {
            return None;
        }
        if next_trans > 0 {
            return Some(next_trans);
        }
        if nu_cmf >= self.linelist[0].nu {
            return Some(0);
        }
        // first line with nu <= nu_cmf; guaranteed to exist by the guard above
        Some(self.linelist.partition_point(|line| line.nu > nu_cmf))
    }

    /// Re-seats a packet's line-list position after it crossed an empty or
    /// optically thick cell, where a single step may jump over many lines.
    ///
    /// Unlike [`Self::closest_transition`] this never trusts the incoming
    /// position and always searches forward from it. Returns the new value
    /// for `next_trans`: the index of the first line with `nu <= nu_cmf`, or
    /// `n_lines() + 1` once the packet is past the red end of the list.
    pub fn closest_transition_reseat(&self, nu_cmf: fpk, next_trans: usize) -> usize {
        let nlines = self.linelist.len();
        if nlines == 0 || nu_cmf < self.linelist[nlines - 1].nu || next_trans > nlines - 1 {
            return nlines + 1;
        }
        if nu_cmf >= self.linelist[next_trans].nu {
            next_trans
        } else {
            next_trans
                + self.linelist[next_trans..].partition_point(|line| line.nu > nu_cmf)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_level_element() -> Vec<Element> {
        vec![Element {
            atomic_number: 20,
            ions: vec![
                Ion {
                    ion_stage: 1,
                    levels: vec![
                        Level { stat_weight: 1.0 },
                        Level { stat_weight: 3.0 },
                        Level { stat_weight: 5.0 },
                    ],
                },
                Ion {
                    ion_stage: 2,
                    levels: vec![Level { stat_weight: 2.0 }],
                },
            ],
        }]
    }

    fn line_at(nu: fpk) -> Line {
        Line {
            nu,
            einstein_a: 1e8,
            osc_strength: 0.1,
            coll_str: -1.0,
            forbidden: false,
            element: 0,
            ion: 0,
            upper: 1,
            lower: 0,
        }
    }

    fn dataset() -> AtomicData {
        AtomicData::new(
            two_level_element(),
            vec![
                line_at(8e14),
                line_at(6e14),
                line_at(5e14),
                line_at(3e14),
            ],
            Vec::new(),
        )
    }

    #[test]
    fn fresh_search_finds_largest_line_frequency_not_above_nu() {
        let atomic = dataset();
        assert_eq!(atomic.closest_transition(9e14, 0), Some(0));
        assert_eq!(atomic.closest_transition(7e14, 0), Some(1));
        assert_eq!(atomic.closest_transition(5.5e14, 0), Some(2));
        assert_eq!(atomic.closest_transition(3e14, 0), Some(3));
        assert_eq!(atomic.closest_transition(2.9e14, 0), None);
    }

    #[test]
    fn known_position_is_trusted_without_research() {
        let atomic = dataset();
        // nu_cmf has drifted just past line 2, but the stored position wins
        assert_eq!(atomic.closest_transition(4.999e14, 2), Some(2));
        assert_eq!(atomic.closest_transition(4.999e14, 4), None);
    }

    #[test]
    fn reseat_never_trusts_the_stored_position() {
        let atomic = dataset();
        assert_eq!(atomic.closest_transition_reseat(4.2e14, 1), 3);
        assert_eq!(atomic.closest_transition_reseat(7e14, 1), 1);
        assert_eq!(atomic.closest_transition_reseat(1e14, 1), 5);
        assert_eq!(atomic.closest_transition_reseat(4.2e14, 5), 5);
    }

    #[test]
    fn phixs_interpolation_is_linear_within_the_table() {
        let cont = PhotoionContinuum {
            element: 0,
            ion: 0,
            level: 0,
            phixstargetindex: 0,
            upper_level: 0,
            nu_edge: 1e15,
            probability: 1.0,
            cross_sections: vec![4e-18, 2e-18, 1e-18],
            nu_step: 0.1,
        };
        assert_eq!(cont.cross_section_at(1e15), 4e-18);
        let halfway = cont.cross_section_at(1.05e15);
        assert!((halfway - 3e-18).abs() < 1e-30);
        // above the table the cross-section falls off as nu^-3
        let above = cont.cross_section_at(2.4e15);
        assert!((above - 1e-18 * (1.2f64 / 2.4).powi(3)).abs() < 1e-32);
        assert_eq!(cont.cross_section_at(0.9e15), 0.0);
    }
}
