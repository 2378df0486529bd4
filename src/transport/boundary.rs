//! Intersection of packet rays with the expanding cell boundaries.

use super::estimators::Counters;
use crate::{
    constants::CLIGHT_PROP,
    geometry::{Dim3, Vec3},
    grid::{CellFace, GridGeometry, GridType},
    packets::{fpk, Packet, PacketKind},
};

/// Accuracy tolerance for the packet-outside-cell drift guard [cm].
const DRIFT_TOLERANCE: fpk = 10.0;

/// Where a boundary crossing leads.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BoundaryTarget {
    /// The neighbouring cell with this index.
    Cell(usize),
    /// Out through the outermost grid face.
    Escape,
}

/// Computes the closest forward intersection of the packet's ray with any
/// face of its current cell, accounting for the homologous expansion of the
/// faces, and the cell the crossing leads into.
///
/// A zero distance is returned when floating-point drift has already placed
/// the packet outside the cell; the packet is then snapped to the
/// neighbouring cell it drifted towards.
pub fn boundary_cross(grid: &GridGeometry, pkt: &mut Packet) -> (fpk, BoundaryTarget) {
    let tstart = pkt.prop_time;
    let cell = pkt.cell;
    let ndim = grid.n_dimensions();
    let time_over_tmin = tstart / grid.t_min();

    // positions and velocities in grid coordinates (x, y, z or radius)
    let coords = grid.grid_coordinates(&pkt.pos);
    let mut vel = [0.0; 3];
    match grid.grid_type() {
        GridType::UniformCartesian3D => {
            for (d, dim) in Dim3::slice().into_iter().enumerate() {
                vel[d] = pkt.dir[dim] * CLIGHT_PROP;
            }
        }
        GridType::Spherical1D => {
            vel[0] = pkt.pos.dot(&pkt.dir) / pkt.pos.length() * CLIGHT_PROP;
        }
    }

    let mut last_cross = pkt.last_cross;

    // drift guard: a packet may sit slightly outside its claimed cell after
    // an imprecise crossing; snap it to the neighbour instead of solving
    // for a face it is no longer approaching from the inside
    for d in 0..ndim {
        for below_lower in [false, true] {
            let dim = Dim3::slice()[d];
            let (direction, invdirection) = if below_lower {
                (CellFace::positive(dim), CellFace::negative(dim))
            } else {
                (CellFace::negative(dim), CellFace::positive(dim))
            };
            let outward = !below_lower;
            let is_outside = if below_lower {
                coords[d] < grid.cell_coord_min(cell, d) * time_over_tmin - DRIFT_TOLERANCE
            } else {
                coords[d] > grid.cell_coord_max(cell, d) * time_over_tmin + DRIFT_TOLERANCE
            };
            if is_outside && last_cross != Some(direction) {
                eprintln!(
                    "[warning] packet {} outside the {}{} face of cell {} \
                     (coordinate {} cell range [{}, {}])",
                    pkt.number,
                    if below_lower { '-' } else { '+' },
                    dim,
                    cell,
                    coords[d],
                    grid.cell_coord_min(cell, d) * time_over_tmin,
                    grid.cell_coord_max(cell, d) * time_over_tmin,
                );
                if vel[d] - coords[d] / tstart > 0.0 {
                    let at_grid_edge = if outward {
                        grid.coord_point_num(cell, d) == grid.n_coord_points(d) - 1
                    } else {
                        grid.coord_point_num(cell, d) == 0
                    };
                    if at_grid_edge {
                        eprintln!("[warning] packet {} is escaping", pkt.number);
                        return (0.0, BoundaryTarget::Escape);
                    }
                    let snext = if outward {
                        cell + grid.coord_index_increment(d)
                    } else {
                        cell - grid.coord_index_increment(d)
                    };
                    pkt.last_cross = Some(invdirection);
                    eprintln!(
                        "[warning] snapping packet {} from cell {} to cell {}",
                        pkt.number, cell, snext
                    );
                    return (0.0, BoundaryTarget::Cell(snext));
                } else {
                    last_cross = Some(direction);
                }
            }
        }
    }

    // time to reach the lower and upper face along each dimension
    let mut t_lower = [fpk::MIN; 3];
    let mut t_upper = [fpk::MIN; 3];
    match grid.grid_type() {
        GridType::Spherical1D => {
            // invalid directions are flagged by negative distances instead
            last_cross = None;
            let r_inner = grid.cell_coord_min(cell, 0) * time_over_tmin;
            t_lower[0] = if r_inner > 0.0 {
                shell_cross_distance(&pkt.pos, &pkt.dir, r_inner, true, tstart)
                    .map_or(-1.0, |dist| dist / CLIGHT_PROP)
            } else {
                -1.0
            };
            let r_outer = grid.cell_coord_max(cell, 0) * time_over_tmin;
            t_upper[0] = shell_cross_distance(&pkt.pos, &pkt.dir, r_outer, false, tstart)
                .map_or(-1.0, |dist| dist / CLIGHT_PROP);
        }
        GridType::UniformCartesian3D => {
            // a face at x(t_min) sits at x(t_min) * t / t_min, so the
            // crossing time solves a linear equation in t
            for d in 0..3 {
                let t_min = grid.t_min();
                t_upper[d] = (coords[d] - vel[d] * tstart)
                    / (grid.cell_coord_max(cell, d) - vel[d] * t_min)
                    * t_min
                    - tstart;
                t_lower[d] = (coords[d] - vel[d] * tstart)
                    / (grid.cell_coord_min(cell, d) - vel[d] * t_min)
                    * t_min
                    - tstart;
            }
        }
    }

    // pick the shortest positive time, excluding the face just crossed
    let mut time = fpk::MAX;
    let mut target = None;
    for d in 0..ndim {
        let dim = Dim3::slice()[d];
        if t_upper[d] > 0.0 && t_upper[d] < time && last_cross != Some(CellFace::negative(dim)) {
            time = t_upper[d];
            if grid.coord_point_num(cell, d) == grid.n_coord_points(d) - 1 {
                target = Some(BoundaryTarget::Escape);
            } else {
                target = Some(BoundaryTarget::Cell(cell + grid.coord_index_increment(d)));
                pkt.last_cross = Some(CellFace::positive(dim));
            }
        }
        if t_lower[d] > 0.0 && t_lower[d] < time && last_cross != Some(CellFace::positive(dim)) {
            time = t_lower[d];
            if grid.coord_point_num(cell, d) == 0 {
                target = Some(BoundaryTarget::Escape);
            } else {
                target = Some(BoundaryTarget::Cell(cell - grid.coord_index_increment(d)));
                pkt.last_cross = Some(CellFace::negative(dim));
            }
        }
    }

    let target = target.unwrap_or_else(|| {
        crate::fatal!(
            "found no boundary crossing for packet {} in cell {}: pos {} dir {} \
             last_cross {:?} crossing times lower {:?} upper {:?} tstart {}",
            pkt.number,
            cell,
            pkt.pos,
            pkt.dir,
            last_cross,
            &t_lower[..ndim],
            &t_upper[..ndim],
            tstart
        )
    });

    (CLIGHT_PROP * time, target)
}

/// Closest forward distance to the intersection of a ray with an expanding
/// spherical shell, or `None` if there is no forward intersection (a
/// tangential graze counts as none).
fn shell_cross_distance(
    pos: &Vec3<fpk>,
    dir: &Vec3<fpk>,
    shellradius: fpk,
    is_inner_boundary: bool,
    tstart: fpk,
) -> Option<fpk> {
    debug_assert!(shellradius > 0.0);
    let speed = dir.length() * CLIGHT_PROP;
    let a = dir.dot(dir) - (shellradius / tstart / speed).powi(2);
    let b = 2.0 * (dir.dot(pos) - shellradius.powi(2) / tstart / speed);
    let c = pos.dot(pos) - shellradius.powi(2);
    let discriminant = b * b - 4.0 * a * c;

    if discriminant < 0.0 {
        // no intersection; only possible when the shell is inside the ray origin
        debug_assert!(shellradius < pos.length());
        return None;
    }
    if discriminant == 0.0 {
        // tangential graze; leave the packet in its cell
        debug_assert!(shellradius <= pos.length());
        return None;
    }

    let mut d1 = (-b + discriminant.sqrt()) / 2.0 / a;
    let mut d2 = (-b - discriminant.sqrt()) / 2.0 / a;
    let posfinal1 = *pos + *dir * d1;
    let posfinal2 = *pos + *dir * d2;
    let shellradiusfinal1 = shellradius / tstart * (tstart + d1 / speed);
    let shellradiusfinal2 = shellradius / tstart * (tstart + d2 / speed);
    crate::fatal_unless!(
        (posfinal1.length() / shellradiusfinal1 - 1.0).abs() < 1e-3
            && (posfinal2.length() / shellradiusfinal2 - 1.0).abs() < 1e-3,
        "shell intersection solutions do not lie on the expanded shell \
         (radii {} and {} for shell radii {} and {})",
        posfinal1.length(),
        posfinal2.length(),
        shellradiusfinal1,
        shellradiusfinal2
    );

    // discard solutions that enter the shell from the wrong radial side
    if is_inner_boundary {
        if posfinal1.dot(dir) > 0.0 {
            d1 = -1.0;
        }
        if posfinal2.dot(dir) > 0.0 {
            d2 = -1.0;
        }
    } else {
        if posfinal1.dot(dir) < 0.0 {
            d1 = -1.0;
        }
        if posfinal2.dot(dir) < 0.0 {
            d2 = -1.0;
        }
    }

    // negative distances lie backwards along the ray
    if d1 < 0.0 && d2 < 0.0 {
        None
    } else if d2 < 0.0 {
        Some(d1)
    } else if d1 < 0.0 {
        Some(d2)
    } else {
        Some(d1.min(d2))
    }
}

/// Takes the packet across a boundary, either into the neighbouring cell or
/// out of the grid.
pub fn change_cell(pkt: &mut Packet, target: BoundaryTarget, counters: &mut Counters) {
    match target {
        BoundaryTarget::Escape => {
            pkt.escape_kind = Some(pkt.kind);
            pkt.escape_time = pkt.prop_time;
            pkt.kind = PacketKind::Escape;
            counters.escapes += 1;
        }
        BoundaryTarget::Cell(snext) => {
            pkt.cell = snext;
            counters.cell_crossings += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frames::DopplerShiftScheme;
    use approx::assert_relative_eq;

    const T0: fpk = 1e5;

    fn cartesian_grid() -> GridGeometry {
        GridGeometry::uniform_cartesian(
            [2, 2, 2],
            [-2e14, -2e14, -2e14],
            [2e14, 2e14, 2e14],
            T0,
            vec![Some(0); 8],
        )
    }

    fn packet_in(cell: usize, pos: Vec3<fpk>, dir: Vec3<fpk>) -> Packet {
        Packet::new_rpacket(
            0,
            cell,
            pos,
            dir,
            5e14,
            1e40,
            T0,
            DopplerShiftScheme::NonRelativistic,
        )
    }

    #[test]
    fn cartesian_crossing_lands_on_a_face() {
        let grid = cartesian_grid();
        let mut pkt = packet_in(
            0,
            Vec3::new(-1e14, -1e14, -1e14),
            Vec3::new(1.0, 0.0, 0.0).normalized(),
        );
        let (sdist, target) = boundary_cross(&grid, &mut pkt);
        assert_eq!(target, BoundaryTarget::Cell(1));
        assert_eq!(pkt.last_cross, Some(CellFace::PosX));
        // the face expands while the packet flies towards it
        let t_cross = pkt.prop_time + sdist / CLIGHT_PROP;
        let face_x = 0.0 * t_cross / T0;
        let landing_x = pkt.pos[0] + pkt.dir[0] * sdist;
        assert!((landing_x - face_x).abs() <= 1e-6 * 2e14);
    }

    #[test]
    fn outermost_cartesian_face_escapes() {
        let grid = cartesian_grid();
        let mut pkt = packet_in(
            7,
            Vec3::new(1e14, 1e14, 1e14),
            Vec3::new(0.0, 0.0, 1.0),
        );
        let (sdist, target) = boundary_cross(&grid, &mut pkt);
        assert!(sdist > 0.0);
        assert_eq!(target, BoundaryTarget::Escape);
    }

    #[test]
    fn spherical_crossing_lands_on_the_expanded_shell() {
        let grid = GridGeometry::spherical(
            vec![0.0, 1e14, 2e14],
            T0,
            vec![Some(0), Some(1)],
        );
        let mut pkt = packet_in(
            0,
            Vec3::new(0.5e14, 0.0, 0.0),
            Vec3::new(1.0, 0.0, 0.0),
        );
        let (sdist, target) = boundary_cross(&grid, &mut pkt);
        assert_eq!(target, BoundaryTarget::Cell(1));
        let t_cross = pkt.prop_time + sdist / CLIGHT_PROP;
        let shell_radius = 1e14 * t_cross / T0;
        let landing = pkt.pos + pkt.dir * sdist;
        assert!((landing.length() - shell_radius).abs() / shell_radius <= 1e-3);
    }

    #[test]
    fn inward_ray_in_outer_shell_reaches_the_inner_boundary() {
        let grid = GridGeometry::spherical(
            vec![0.0, 1e14, 2e14],
            T0,
            vec![Some(0), Some(1)],
        );
        let mut pkt = packet_in(
            1,
            Vec3::new(1.5e14, 0.0, 0.0),
            Vec3::new(-1.0, 0.0, 0.0),
        );
        let (sdist, target) = boundary_cross(&grid, &mut pkt);
        assert_eq!(target, BoundaryTarget::Cell(0));
        assert_eq!(pkt.last_cross, Some(CellFace::NegX));
        assert!(sdist > 0.0);
    }

    #[test]
    fn radially_outward_ray_in_outermost_shell_escapes() {
        let grid = GridGeometry::spherical(
            vec![0.0, 1e14, 2e14],
            T0,
            vec![Some(0), Some(1)],
        );
        let mut pkt = packet_in(
            1,
            Vec3::new(1.5e14, 0.0, 0.0),
            Vec3::new(1.0, 0.0, 0.0),
        );
        let (_, target) = boundary_cross(&grid, &mut pkt);
        assert_eq!(target, BoundaryTarget::Escape);
    }

    #[test]
    fn escape_transitions_the_packet_and_records_provenance() {
        let mut pkt = packet_in(0, Vec3::new(1e14, 0.0, 0.0), Vec3::new(1.0, 0.0, 0.0));
        let mut counters = Counters::new(0);
        change_cell(&mut pkt, BoundaryTarget::Escape, &mut counters);
        assert_eq!(pkt.kind, PacketKind::Escape);
        assert_eq!(pkt.escape_kind, Some(PacketKind::RPacket));
        assert_relative_eq!(pkt.escape_time, pkt.prop_time);
        assert_eq!(counters.escapes, 1);
    }
}
