//! Propagation grid geometry and model-grid state.
//!
//! The propagation grid is a set of cells that expand homologously: a face
//! at coordinate `x` at the reference time `t_min` sits at `x * t / t_min`
//! at time `t`. Cells map onto model-grid cells holding the physical state;
//! cells outside the ejecta map to no model cell at all.

use crate::{
    geometry::{Dim3, Vec3},
    packets::fpk,
};

#[cfg(feature = "serialization")]
use serde::Serialize;

/// The supported propagation-grid geometries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GridType {
    UniformCartesian3D,
    Spherical1D,
}

/// A face of a propagation-grid cell.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serialization", derive(Serialize))]
pub enum CellFace {
    NegX,
    PosX,
    NegY,
    PosY,
    NegZ,
    PosZ,
}

impl CellFace {
    /// The face on the negative side of the given dimension.
    pub fn negative(dim: Dim3) -> Self {
        match dim {
            Dim3::X => Self::NegX,
            Dim3::Y => Self::NegY,
            Dim3::Z => Self::NegZ,
        }
    }

    /// The face on the positive side of the given dimension.
    pub fn positive(dim: Dim3) -> Self {
        match dim {
            Dim3::X => Self::PosX,
            Dim3::Y => Self::PosY,
            Dim3::Z => Self::PosZ,
        }
    }
}

#[derive(Clone, Debug)]
enum Topology {
    /// Uniform Cartesian grid; coordinates are at the reference time.
    UniformCartesian3D {
        shape: [usize; 3],
        coord_min: [fpk; 3],
        cell_width: [fpk; 3],
    },
    /// Concentric shells; edge radii are at the reference time.
    Spherical1D { radial_edges: Vec<fpk> },
}

/// Geometry of the homologously expanding propagation grid.
#[derive(Clone, Debug)]
pub struct GridGeometry {
    topology: Topology,
    t_min: fpk,
    r_max: fpk,
    cell_mgi: Vec<Option<usize>>,
}

impl GridGeometry {
    /// Creates a uniform 3D Cartesian grid.
    ///
    /// `coord_min` and `cell_width` are at the reference time `t_min`.
    /// `cell_mgi` maps every cell (in x-fastest order) to its model-grid
    /// cell, with `None` marking cells outside the ejecta.
    pub fn uniform_cartesian(
        shape: [usize; 3],
        coord_min: [fpk; 3],
        cell_width: [fpk; 3],
        t_min: fpk,
        cell_mgi: Vec<Option<usize>>,
    ) -> Self {
        crate::fatal_unless!(
            cell_mgi.len() == shape[0] * shape[1] * shape[2],
            "cell to model-grid map has {} entries for a {}x{}x{} grid",
            cell_mgi.len(),
            shape[0],
            shape[1],
            shape[2]
        );
        let r_max = (0..3)
            .map(|d| {
                let far = coord_min[d] + shape[d] as fpk * cell_width[d];
                coord_min[d].abs().max(far.abs())
            })
            .map(|extent| extent * extent)
            .sum::<fpk>()
            .sqrt();
        Self {
            topology: Topology::UniformCartesian3D {
                shape,
                coord_min,
                cell_width,
            },
            t_min,
            r_max,
            cell_mgi,
        }
    }

    /// Creates a 1D spherical grid from shell edge radii at `t_min`.
    pub fn spherical(radial_edges: Vec<fpk>, t_min: fpk, cell_mgi: Vec<Option<usize>>) -> Self {
        crate::fatal_unless!(
            radial_edges.len() >= 2,
            "a spherical grid needs at least two edge radii"
        );
        crate::fatal_unless!(
            cell_mgi.len() == radial_edges.len() - 1,
            "cell to model-grid map has {} entries for {} shells",
            cell_mgi.len(),
            radial_edges.len() - 1
        );
        for window in radial_edges.windows(2) {
            crate::fatal_unless!(
                window[1] > window[0],
                "shell edge radii are not strictly increasing"
            );
        }
        let r_max = radial_edges[radial_edges.len() - 1];
        Self {
            topology: Topology::Spherical1D { radial_edges },
            t_min,
            r_max,
            cell_mgi,
        }
    }

    /// The geometry variant of this grid.
    pub fn grid_type(&self) -> GridType {
        match self.topology {
            Topology::UniformCartesian3D { .. } => GridType::UniformCartesian3D,
            Topology::Spherical1D { .. } => GridType::Spherical1D,
        }
    }

    /// The reference time at which the grid coordinates are defined [s].
    pub fn t_min(&self) -> fpk {
        self.t_min
    }

    /// The outermost radius of the grid at the reference time [cm].
    pub fn r_max(&self) -> fpk {
        self.r_max
    }

    /// The total number of propagation cells.
    pub fn n_cells(&self) -> usize {
        self.cell_mgi.len()
    }

    /// The number of grid dimensions (3 for Cartesian, 1 for spherical).
    pub fn n_dimensions(&self) -> usize {
        match self.topology {
            Topology::UniformCartesian3D { .. } => 3,
            Topology::Spherical1D { .. } => 1,
        }
    }

    /// Maps a propagation cell to its model-grid cell, or `None` if the
    /// cell lies outside the ejecta.
    pub fn cell_model_index(&self, cell: usize) -> Option<usize> {
        self.cell_mgi[cell]
    }

    /// The lower coordinate of the cell along the given dimension, at the
    /// reference time [cm].
    pub fn cell_coord_min(&self, cell: usize, d: usize) -> fpk {
        match &self.topology {
            Topology::UniformCartesian3D {
                coord_min,
                cell_width,
                ..
            } => coord_min[d] + self.coord_point_num(cell, d) as fpk * cell_width[d],
            Topology::Spherical1D { radial_edges } => radial_edges[cell],
        }
    }

    /// The upper coordinate of the cell along the given dimension, at the
    /// reference time [cm].
    pub fn cell_coord_max(&self, cell: usize, d: usize) -> fpk {
        match &self.topology {
            Topology::UniformCartesian3D { .. } => {
                self.cell_coord_min(cell, d) + self.cell_width(cell, d)
            }
            Topology::Spherical1D { radial_edges } => radial_edges[cell + 1],
        }
    }

    /// The width of the cell along the given dimension, at the reference
    /// time [cm].
    pub fn cell_width(&self, cell: usize, d: usize) -> fpk {
        match &self.topology {
            Topology::UniformCartesian3D { cell_width, .. } => cell_width[d],
            Topology::Spherical1D { radial_edges } => radial_edges[cell + 1] - radial_edges[cell],
        }
    }

    /// The difference in cell index between neighbours along the given
    /// dimension.
    pub fn coord_index_increment(&self, d: usize) -> usize {
        match &self.topology {
            Topology::UniformCartesian3D { shape, .. } => match d {
                0 => 1,
                1 => shape[0],
                _ => shape[0] * shape[1],
            },
            Topology::Spherical1D { .. } => 1,
        }
    }

    /// The position of the cell along the given dimension, in cells.
    pub fn coord_point_num(&self, cell: usize, d: usize) -> usize {
        match &self.topology {
            Topology::UniformCartesian3D { shape, .. } => match d {
                0 => cell % shape[0],
                1 => (cell / shape[0]) % shape[1],
                _ => cell / (shape[0] * shape[1]),
            },
            Topology::Spherical1D { .. } => cell,
        }
    }

    /// The number of cells along the given dimension.
    pub fn n_coord_points(&self, d: usize) -> usize {
        match &self.topology {
            Topology::UniformCartesian3D { shape, .. } => shape[d],
            Topology::Spherical1D { .. } => self.cell_mgi.len(),
        }
    }

    /// The grid coordinates of a rest-frame position: `(x, y, z)` for
    /// Cartesian grids, the radius for spherical ones.
    pub fn grid_coordinates(&self, pos: &Vec3<fpk>) -> [fpk; 3] {
        match &self.topology {
            Topology::UniformCartesian3D { .. } => [pos[0], pos[1], pos[2]],
            Topology::Spherical1D { .. } => [pos.length(), 0.0, 0.0],
        }
    }
}

/// Physical state of a single model-grid cell.
#[derive(Clone, Debug)]
pub struct ModelCell {
    /// Free electron density [1/cm^3].
    pub electron_density: fpk,
    /// Total electron density including bound electrons [1/cm^3].
    pub total_electron_density: fpk,
    /// Electron temperature [K].
    pub electron_temperature: fpk,
    /// Mass density [g/cm^3].
    pub mass_density: fpk,
    /// Whether the cell is treated in the grey approximation.
    pub thick: bool,
    /// Grey mass absorption coefficient [cm^2/g].
    pub grey_opacity: fpk,
    /// Mass fraction of each element.
    pub abundances: Vec<fpk>,
    /// Ion number densities, indexed `[element][ion]` [1/cm^3].
    pub ion_populations: Vec<Vec<fpk>>,
    /// Level number densities, indexed `[element][ion][level]` [1/cm^3].
    pub level_populations: Vec<Vec<Vec<fpk>>>,
}

/// Physical state of all model-grid cells.
#[derive(Clone, Debug)]
pub struct ModelGrid {
    cells: Vec<ModelCell>,
}

impl ModelGrid {
    /// Wraps the given cell states.
    pub fn new(cells: Vec<ModelCell>) -> Self {
        Self { cells }
    }

    /// The number of model-grid cells.
    pub fn n_cells(&self) -> usize {
        self.cells.len()
    }

    /// Free electron density of the cell [1/cm^3].
    pub fn electron_density(&self, mgi: usize) -> fpk {
        self.cells[mgi].electron_density
    }

    /// Total electron density of the cell [1/cm^3].
    pub fn total_electron_density(&self, mgi: usize) -> fpk {
        self.cells[mgi].total_electron_density
    }

    /// Electron temperature of the cell [K].
    pub fn temperature_e(&self, mgi: usize) -> fpk {
        self.cells[mgi].electron_temperature
    }

    /// Mass density of the cell [g/cm^3].
    pub fn mass_density(&self, mgi: usize) -> fpk {
        self.cells[mgi].mass_density
    }

    /// Whether the cell is treated in the grey approximation.
    pub fn is_thick(&self, mgi: usize) -> bool {
        self.cells[mgi].thick
    }

    /// Grey mass absorption coefficient of the cell [cm^2/g].
    pub fn grey_opacity(&self, mgi: usize) -> fpk {
        self.cells[mgi].grey_opacity
    }

    /// Mass fraction of the given element in the cell.
    pub fn element_abundance(&self, mgi: usize, element: usize) -> fpk {
        self.cells[mgi].abundances[element]
    }

    /// Number density of the given ion in the cell [1/cm^3].
    pub fn ion_population(&self, mgi: usize, element: usize, ion: usize) -> fpk {
        self.cells[mgi].ion_populations[element][ion]
    }

    /// The number of ion populations stored for the given element in the
    /// cell, for validation against the atomic dataset.
    pub fn ion_population_count(&self, mgi: usize, element: usize) -> usize {
        self.cells[mgi].ion_populations[element].len()
    }

    /// Number density of the given level in the cell [1/cm^3].
    pub fn level_population(&self, mgi: usize, element: usize, ion: usize, level: usize) -> fpk {
        self.cells[mgi].level_populations[element][ion][level]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cartesian_index_math_roundtrips() {
        let shape = [4, 3, 2];
        let n = shape[0] * shape[1] * shape[2];
        let grid = GridGeometry::uniform_cartesian(
            shape,
            [-2e14, -1.5e14, -1e14],
            [1e14, 1e14, 1e14],
            1e5,
            vec![Some(0); n],
        );
        for cell in 0..n {
            let (i, j, k) = (
                grid.coord_point_num(cell, 0),
                grid.coord_point_num(cell, 1),
                grid.coord_point_num(cell, 2),
            );
            assert_eq!(
                cell,
                i + j * grid.coord_index_increment(1) + k * grid.coord_index_increment(2)
            );
        }
        assert_eq!(grid.cell_coord_min(0, 0), -2e14);
        assert_eq!(grid.cell_coord_max(1, 0), 0.0);
    }

    #[test]
    fn spherical_shells_expose_edge_radii() {
        let grid = GridGeometry::spherical(
            vec![0.0, 1e14, 2e14, 4e14],
            1e5,
            vec![Some(0), Some(1), None],
        );
        assert_eq!(grid.n_cells(), 3);
        assert_eq!(grid.cell_coord_min(1, 0), 1e14);
        assert_eq!(grid.cell_coord_max(2, 0), 4e14);
        assert_eq!(grid.cell_model_index(2), None);
        assert_eq!(grid.r_max(), 4e14);
    }
}
