//! Spherical patch mesh generation.
//!
//! Builds the template geometry every tile of a given (level, latitude band)
//! slot is rendered with: full spheres and hemispheres for the low base
//! levels, latitude-banded sphere patches for everything above. All
//! generation runs in f64 and is truncated to f32 on vertex write-out.

use bytemuck::{Pod, Zeroable};
use glam::{DVec3, Vec3};
use std::f32::consts::PI as PI32;
use std::f64::consts::{FRAC_PI_2, TAU};

/// Micro-texture coordinate multiplier of the second UV channel.
pub const TEX2_MULTIPLIER: f32 = 4.0;

/// Vertex layout of every patch template mesh: position, normal and two
/// texture coordinate pairs (surface + micro detail).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
pub struct PatchVertex {
    pub pos: [f32; 3],
    pub normal: [f32; 3],
    pub uv0: [f32; 2],
    pub uv1: [f32; 2],
}

/// CPU-side patch geometry with its precomputed bounding sphere.
#[derive(Clone, Debug)]
pub struct PatchGeometry {
    pub vertices: Vec<PatchVertex>,
    pub indices: Vec<u16>,
    /// Bounding sphere centre in patch-local coordinates.
    pub bs_center: Vec3,
    /// Bounding sphere radius.
    pub bs_radius: f32,
}

/// Parameters of [`create_sphere_patch`].
#[derive(Clone, Copy, Debug)]
pub struct SpherePatchParams {
    /// Longitude columns at this level.
    pub nlng: u32,
    /// Latitude bands per hemisphere at this level.
    pub nlat: u32,
    /// Latitude band index (0 = equator).
    pub ilat: u32,
    /// Latitudinal mesh resolution.
    pub res: u32,
    /// Longitudinal segments at the band's equator edge; negative means
    /// "derive from `res`" (also forced for the polar band).
    pub bseg: i32,
    /// Taper the longitudinal segment count towards the pole.
    pub reduce: bool,
    /// Face outward (normals away from the planet centre).
    pub outside: bool,
    /// Store vertex positions relative to the band's lower-left corner
    /// instead of the sphere centre.
    pub shift_origin: bool,
}

/// Create a full sphere or hemisphere mesh of radius 1.
///
/// Vertex count is `nrings·(2·nrings+1)+2` for a full sphere and
/// `nrings·(nrings+1)+2` for a hemisphere. `texres` is the texture width in
/// texels used to inset the U coordinates by half a texel against seams.
pub fn create_sphere(nrings: u32, hemisphere: bool, which_half: u32, texres: u32) -> PatchGeometry {
    let x1 = if hemisphere { nrings } else { nrings * 2 };
    let x2 = x1 + 1;
    let nvtx = (nrings * x2 + 2) as usize;
    let nidx = if hemisphere {
        6 * nrings * nrings
    } else {
        12 * nrings * nrings
    } as usize;

    let mut vertices = Vec::with_capacity(nvtx);
    let mut indices: Vec<u16> = Vec::with_capacity(nidx);

    let dang = PI32 / nrings as f32;
    let du = 0.5 / texres as f32;
    let a = (1.0 - 2.0 * du) / x1 as f32;

    let mut ang_y = dang;
    for _ in 0..nrings {
        let y0 = ang_y.cos();
        let r0 = ang_y.sin();
        let tv = ang_y / PI32;

        for x in 0..x2 {
            let mut ang_x = x as f32 * dang - PI32; // wrap at +-180 deg
            if hemisphere && which_half != 0 {
                ang_x += PI32;
            }
            let v = [r0 * ang_x.cos(), y0, r0 * ang_x.sin()];
            let tu = a * x as f32 + du;
            vertices.push(PatchVertex {
                pos: v,
                normal: v,
                uv0: [tu, tv],
                uv1: [tu, tv],
            });
        }
        ang_y += dang;
    }

    for y in 0..nrings - 1 {
        for x in 0..x1 {
            indices.push((y * x2 + x) as u16);
            indices.push((y * x2 + x + 1) as u16);
            indices.push(((y + 1) * x2 + x) as u16);
            indices.push((y * x2 + x + 1) as u16);
            indices.push(((y + 1) * x2 + x + 1) as u16);
            indices.push(((y + 1) * x2 + x) as u16);
        }
    }

    // pole caps
    let north = vertices.len() as u16;
    vertices.push(PatchVertex {
        pos: [0.0, 1.0, 0.0],
        normal: [0.0, 1.0, 0.0],
        uv0: [0.5, 0.0],
        uv1: [0.5, 0.0],
    });
    let south = vertices.len() as u16;
    vertices.push(PatchVertex {
        pos: [0.0, -1.0, 0.0],
        normal: [0.0, -1.0, 0.0],
        uv0: [0.5, 1.0],
        uv1: [0.5, 1.0],
    });

    let last = nrings - 1;
    for x in 0..x1 {
        indices.push(south);
        indices.push((last * x2 + x + 1) as u16);
        indices.push((last * x2 + x) as u16);
    }
    for x in 0..x1 {
        indices.push(north);
        indices.push((x + 1) as u16);
        indices.push(x as u16);
    }

    let (bs_center, bs_radius) = bounding_sphere(&vertices);
    PatchGeometry {
        vertices,
        indices,
        bs_center,
        bs_radius,
    }
}

/// Create one latitude-banded sphere patch of radius 1.
///
/// Vertex count is `(bseg+1)·(res+1)`, reduced by `((res+1)·res)/2` when the
/// band tapers (`reduce`). The patch covers latitudes
/// `[π/2·ilat/nlat, π/2·(ilat+1)/nlat]` and longitudes `[0, 2π/nlng]`.
pub fn create_sphere_patch(p: SpherePatchParams) -> PatchGeometry {
    let minlat = FRAC_PI_2 * p.ilat as f64 / p.nlat as f64;
    let maxlat = FRAC_PI_2 * (p.ilat + 1) as f64 / p.nlat as f64;
    let minlng = 0.0;
    let maxlng = TAU / p.nlng as f64;

    let res = p.res as usize;
    let bseg = if p.bseg < 0 || p.ilat == p.nlat - 1 {
        ((p.nlat - p.ilat) * p.res) as usize
    } else {
        p.bseg as usize
    };

    let mut nvtx = (bseg + 1) * (res + 1);
    if p.reduce {
        nvtx -= ((res + 1) * res) / 2;
    }
    let mut vertices = Vec::with_capacity(nvtx);

    // lower-left corner of the band, subtracted from every position when the
    // origin is shifted
    let (ox, oy) = if p.shift_origin {
        (minlat.cos() as f32, minlat.sin() as f32)
    } else {
        (0.0, 0.0)
    };

    for i in 0..=res {
        let lat = minlat + (maxlat - minlat) * i as f64 / res as f64;
        let (slat, clat) = lat.sin_cos();
        let nseg = if p.reduce { bseg - i } else { bseg };
        for j in 0..=nseg {
            let lng = if nseg > 0 {
                minlng + (maxlng - minlng) * j as f64 / nseg as f64
            } else {
                0.0
            };
            let (slng, clng) = lng.sin_cos();
            let pos = DVec3::new(clat * clng, slat, clat * slng);
            let normal = if p.outside { pos } else { -pos };

            let tu0 = if nseg > 0 { j as f32 / nseg as f32 } else { 0.5 };
            let tv0 = (res - i) as f32 / res as f32;
            let tu1 = if nseg > 0 { tu0 * TEX2_MULTIPLIER } else { 0.5 };
            let tv1 = tv0 * TEX2_MULTIPLIER;

            let mut v = pos.as_vec3().to_array();
            v[0] -= ox;
            v[1] -= oy;

            vertices.push(PatchVertex {
                pos: v,
                normal: normal.as_vec3().to_array(),
                uv0: [tu0, tv0],
                uv1: [tu1, tv1],
            });
        }
    }

    let nidx = if p.reduce {
        res * (2 * bseg - res) * 3
    } else {
        2 * res * bseg * 3
    };
    let mut indices: Vec<u16> = Vec::with_capacity(nidx);

    let mut nofs0 = 0usize;
    for i in 0..res {
        let nseg = if p.reduce { bseg - i } else { bseg };
        let nofs1 = nofs0 + nseg + 1;
        for j in 0..nseg {
            indices.push((nofs0 + j) as u16);
            indices.push((nofs1 + j) as u16);
            indices.push((nofs0 + j + 1) as u16);
            if p.reduce && j == nseg - 1 {
                break; // polar-side quad collapses to a single triangle
            }
            indices.push((nofs0 + j + 1) as u16);
            indices.push((nofs1 + j) as u16);
            indices.push((nofs1 + j + 1) as u16);
        }
        nofs0 = nofs1;
    }

    if !p.outside {
        for tri in indices.chunks_exact_mut(3) {
            tri.swap(1, 2);
        }
    }

    let (bs_center, bs_radius) = bounding_sphere(&vertices);
    PatchGeometry {
        vertices,
        indices,
        bs_center,
        bs_radius,
    }
}

/// Bounding sphere from the AABB centre and the farthest vertex.
fn bounding_sphere(vertices: &[PatchVertex]) -> (Vec3, f32) {
    if vertices.is_empty() {
        return (Vec3::ZERO, 0.0);
    }
    let mut min = Vec3::from_array(vertices[0].pos);
    let mut max = min;
    for v in vertices {
        let p = Vec3::from_array(v.pos);
        min = min.min(p);
        max = max.max(p);
    }
    let center = (min + max) * 0.5;
    let mut radius_sq = 0.0f32;
    for v in vertices {
        radius_sq = radius_sq.max(Vec3::from_array(v.pos).distance_squared(center));
    }
    (center, radius_sq.sqrt())
}
