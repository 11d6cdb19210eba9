use glam::DVec2;

use super::aabb::Aabb;
use super::body::{Body, rotate};

/// Sub-polygons below this area are discarded as degenerate.
const MIN_AREA: f64 = 10.0;

#[derive(Debug, Clone)]
pub struct ConvexPolygon {
    pub points: Vec<DVec2>,
    pub normals: Vec<DVec2>,
}

impl ConvexPolygon {
    pub fn new(points: Vec<DVec2>) -> Self {
        let n = points.len();
        let centroid = points.iter().sum::<DVec2>() / n as f64;
        let normals = (0..n)
            .map(|i| {
                let edge = points[(i + 1) % n] - points[i];
                let mut normal = DVec2::new(edge.y, -edge.x).normalize_or_zero();
                let mid = (points[i] + points[(i + 1) % n]) * 0.5;
                if normal.dot(mid - centroid) < 0.0 {
                    normal = -normal;
                }
                normal
            })
            .collect();
        Self { points, normals }
    }
}

#[derive(Debug, Clone)]
pub enum Collider {
    Circle { radius: f64 },
    Polygon(ConvexPolygon),
}

impl Collider {
    pub fn bounds(&self, pos: DVec2, rot: f64) -> Aabb {
        match self {
            Collider::Circle { radius } => Aabb::new(
                pos - DVec2::splat(*radius),
                pos + DVec2::splat(*radius),
            ),
            Collider::Polygon(poly) => {
                let mut bounds = Aabb::point(pos + rotate(poly.points[0], rot));
                for &p in &poly.points[1..] {
                    bounds = bounds.union(Aabb::point(pos + rotate(p, rot)));
                }
                bounds
            }
        }
    }
}

/// Signed double area of the triangle `a b c`; positive when the turn
/// at `b` is counter-clockwise for positive-area winding.
fn area2(a: DVec2, b: DVec2, c: DVec2) -> f64 {
    (b - a).perp_dot(c - a)
}

pub fn shoelace_area(points: &[DVec2]) -> f64 {
    let n = points.len();
    (0..n)
        .map(|i| points[i].perp_dot(points[(i + 1) % n]))
        .sum::<f64>()
        / 2.0
}

/// Normalise winding so the shoelace area is positive.
pub fn ensure_winding(points: &mut Vec<DVec2>) {
    if shoelace_area(points) < 0.0 {
        points.reverse();
    }
}

/// Area, centroid and the second moment of area per unit mass (taken
/// about the centroid), via the standard shoelace integrals.
pub fn polygon_properties(points: &[DVec2]) -> (f64, DVec2, f64) {
    let n = points.len();
    let area = shoelace_area(points);
    let mut centroid = DVec2::ZERO;
    for i in 0..n {
        let (a, b) = (points[i], points[(i + 1) % n]);
        centroid += (a + b) * a.perp_dot(b);
    }
    centroid /= 6.0 * area;

    let mut moment = 0.0;
    for i in 0..n {
        let a = points[i] - centroid;
        let b = points[(i + 1) % n] - centroid;
        moment += a.perp_dot(b) * (a.dot(a) + a.dot(b) + b.dot(b));
    }
    moment /= 6.0 * area;

    (area, centroid, moment)
}

fn point_in_triangle(a: DVec2, b: DVec2, c: DVec2, p: DVec2) -> bool {
    let d1 = area2(a, b, p);
    let d2 = area2(b, c, p);
    let d3 = area2(c, a, p);
    let has_neg = d1 < 0.0 || d2 < 0.0 || d3 < 0.0;
    let has_pos = d1 > 0.0 || d2 > 0.0 || d3 > 0.0;
    !(has_neg && has_pos)
}

/// Ear-clipping decomposition into triangles, the convex parts handed
/// to the narrow phase. Expects positive-area winding; near-degenerate
/// input yields no parts.
pub fn triangulate(points: &[DVec2]) -> Vec<ConvexPolygon> {
    if points.len() < 3 || shoelace_area(points).abs() < MIN_AREA {
        return Vec::new();
    }

    let mut verts: Vec<DVec2> = points.to_vec();
    let mut parts = Vec::new();
    while verts.len() > 3 {
        let n = verts.len();
        let mut clipped = false;
        for i in 0..n {
            let prev = verts[(i + n - 1) % n];
            let cur = verts[i];
            let next = verts[(i + 1) % n];
            if area2(prev, cur, next) <= 0.0 {
                continue;
            }
            let blocked = verts
                .iter()
                .enumerate()
                .filter(|&(j, _)| j != (i + n - 1) % n && j != i && j != (i + 1) % n)
                .any(|(_, &p)| point_in_triangle(prev, cur, next, p));
            if blocked {
                continue;
            }
            if area2(prev, cur, next).abs() >= 2.0 * MIN_AREA {
                parts.push(ConvexPolygon::new(vec![prev, cur, next]));
            }
            verts.remove(i);
            clipped = true;
            break;
        }
        if !clipped {
            // Numerically stuck; keep what we have.
            break;
        }
    }
    if verts.len() == 3 && area2(verts[0], verts[1], verts[2]).abs() >= 2.0 * MIN_AREA {
        parts.push(ConvexPolygon::new(verts));
    }
    parts
}

#[derive(Debug, Clone, Copy)]
pub struct ManifoldPoint {
    pub world: DVec2,
    pub local_a: DVec2,
    pub local_b: DVec2,
    pub penetration: f64,
}

/// Contact manifold between two colliders. `normal` is in world space
/// and points from body A towards body B.
#[derive(Debug, Clone)]
pub struct Manifold {
    pub normal: DVec2,
    pub points: Vec<ManifoldPoint>,
}

fn manifold_point(a: &Body, b: &Body, world: DVec2, penetration: f64) -> ManifoldPoint {
    ManifoldPoint {
        world,
        local_a: a.world_to_local(world),
        local_b: b.world_to_local(world),
        penetration,
    }
}

pub fn collide(a: &Body, ca: &Collider, b: &Body, cb: &Collider) -> Option<Manifold> {
    match (ca, cb) {
        (Collider::Circle { radius: ra }, Collider::Circle { radius: rb }) => {
            circle_circle(a, *ra, b, *rb)
        }
        (Collider::Polygon(poly), Collider::Circle { radius }) => {
            polygon_circle(a, poly, b, *radius)
        }
        (Collider::Circle { radius }, Collider::Polygon(poly)) => {
            polygon_circle(b, poly, a, *radius).map(|mut m| {
                m.normal = -m.normal;
                for p in &mut m.points {
                    std::mem::swap(&mut p.local_a, &mut p.local_b);
                }
                m
            })
        }
        (Collider::Polygon(pa), Collider::Polygon(pb)) => polygon_polygon(a, pa, b, pb),
    }
}

fn circle_circle(a: &Body, ra: f64, b: &Body, rb: f64) -> Option<Manifold> {
    let delta = b.pos - a.pos;
    let dist = delta.length();
    let penetration = ra + rb - dist;
    if penetration <= 0.0 {
        return None;
    }
    let normal = if dist > 1e-9 {
        delta / dist
    } else {
        DVec2::X
    };
    let world = a.pos + normal * (ra - penetration * 0.5);
    Some(Manifold {
        normal,
        points: vec![manifold_point(a, b, world, penetration)],
    })
}

/// Polygon on `a`, circle on `b`. Normal points from the polygon body
/// towards the circle body.
fn polygon_circle(a: &Body, poly: &ConvexPolygon, b: &Body, radius: f64) -> Option<Manifold> {
    let center = a.world_to_local(b.pos);

    let n = poly.points.len();
    let mut best_face = 0;
    let mut best_sep = f64::NEG_INFINITY;
    for i in 0..n {
        let sep = poly.normals[i].dot(center - poly.points[i]);
        if sep > best_sep {
            best_sep = sep;
            best_face = i;
        }
    }

    if best_sep > radius {
        return None;
    }

    let (normal_local, closest, penetration) = if best_sep < 1e-9 {
        // Centre inside the polygon: push out along the shallowest face.
        let normal = poly.normals[best_face];
        let closest = center - normal * best_sep;
        (normal, closest, radius - best_sep)
    } else {
        let v1 = poly.points[best_face];
        let v2 = poly.points[(best_face + 1) % n];
        let edge = v2 - v1;
        let t = ((center - v1).dot(edge) / edge.length_squared()).clamp(0.0, 1.0);
        let closest = v1 + edge * t;
        let delta = center - closest;
        let dist = delta.length();
        if dist > radius {
            return None;
        }
        let normal = if dist > 1e-9 {
            delta / dist
        } else {
            poly.normals[best_face]
        };
        (normal, closest, radius - dist)
    };

    let normal = a.local_to_world_vec(normal_local);
    let world = a.local_to_world(closest);
    Some(Manifold {
        normal,
        points: vec![manifold_point(a, b, world, penetration)],
    })
}

struct FaceQuery {
    face: usize,
    separation: f64,
}

fn best_face(
    body: &Body,
    poly: &ConvexPolygon,
    other_body: &Body,
    other: &ConvexPolygon,
) -> FaceQuery {
    let mut best = FaceQuery {
        face: 0,
        separation: f64::NEG_INFINITY,
    };
    for (i, &normal) in poly.normals.iter().enumerate() {
        let world_normal = body.local_to_world_vec(normal);
        let face_point = body.local_to_world(poly.points[i]);
        let mut min_sep = f64::INFINITY;
        for &p in &other.points {
            let sep = world_normal.dot(other_body.local_to_world(p) - face_point);
            min_sep = min_sep.min(sep);
        }
        if min_sep > best.separation {
            best = FaceQuery {
                face: i,
                separation: min_sep,
            };
        }
    }
    best
}

/// Clip a two-point segment against the half-plane `normal · p <= offset`.
fn clip_segment(points: &mut Vec<DVec2>, normal: DVec2, offset: f64) {
    if points.len() < 2 {
        points.retain(|&p| normal.dot(p) - offset <= 0.0);
        return;
    }
    let (p1, p2) = (points[0], points[1]);
    let s1 = normal.dot(p1) - offset;
    let s2 = normal.dot(p2) - offset;

    let mut out = Vec::with_capacity(2);
    if s1 <= 0.0 {
        out.push(p1);
    }
    if s2 <= 0.0 {
        out.push(p2);
    }
    if s1 * s2 < 0.0 {
        let t = s1 / (s1 - s2);
        out.push(p1 + (p2 - p1) * t);
    }
    *points = out;
}

fn polygon_polygon(a: &Body, pa: &ConvexPolygon, b: &Body, pb: &ConvexPolygon) -> Option<Manifold> {
    let query_a = best_face(a, pa, b, pb);
    if query_a.separation > 0.0 {
        return None;
    }
    let query_b = best_face(b, pb, a, pa);
    if query_b.separation > 0.0 {
        return None;
    }

    // The polygon with the shallower penetration owns the reference
    // face; the other contributes the incident face.
    let flipped = query_b.separation > query_a.separation + 1e-9;
    let (ref_body, ref_poly, ref_face, inc_body, inc_poly) = if flipped {
        (b, pb, query_b.face, a, pa)
    } else {
        (a, pa, query_a.face, b, pb)
    };

    let n = ref_poly.points.len();
    let ref_normal = ref_body.local_to_world_vec(ref_poly.normals[ref_face]);
    let ref_v1 = ref_body.local_to_world(ref_poly.points[ref_face]);
    let ref_v2 = ref_body.local_to_world(ref_poly.points[(ref_face + 1) % n]);

    // Incident face: the one most anti-parallel to the reference normal.
    let mut inc_face = 0;
    let mut min_dot = f64::INFINITY;
    for (i, &normal) in inc_poly.normals.iter().enumerate() {
        let d = ref_normal.dot(inc_body.local_to_world_vec(normal));
        if d < min_dot {
            min_dot = d;
            inc_face = i;
        }
    }
    let m = inc_poly.points.len();
    let inc_v1 = inc_body.local_to_world(inc_poly.points[inc_face]);
    let inc_v2 = inc_body.local_to_world(inc_poly.points[(inc_face + 1) % m]);

    // Clip the incident edge against the reference side planes.
    let tangent = (ref_v2 - ref_v1).normalize_or_zero();
    let mut clipped = vec![inc_v1, inc_v2];
    clip_segment(&mut clipped, -tangent, -tangent.dot(ref_v1));
    if clipped.len() < 2 {
        return None;
    }
    clip_segment(&mut clipped, tangent, tangent.dot(ref_v2));
    if clipped.is_empty() {
        return None;
    }

    let mut points = Vec::with_capacity(2);
    for p in clipped.into_iter().take(2) {
        let separation = ref_normal.dot(p - ref_v1);
        if separation <= 0.0 {
            points.push(manifold_point(a, b, p, -separation));
        }
    }
    if points.is_empty() {
        return None;
    }

    let normal = if flipped { -ref_normal } else { ref_normal };
    Some(Manifold { normal, points })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body_at(pos: DVec2) -> Body {
        let mut body = Body::new(1.0, 1.0, 0.0, 0.5);
        body.pos = pos;
        body
    }

    fn unit_box(half: f64) -> Collider {
        Collider::Polygon(ConvexPolygon::new(vec![
            DVec2::new(-half, -half),
            DVec2::new(half, -half),
            DVec2::new(half, half),
            DVec2::new(-half, half),
        ]))
    }

    #[test]
    fn circles_overlap() {
        let a = body_at(DVec2::ZERO);
        let b = body_at(DVec2::new(15.0, 0.0));
        let manifold = collide(
            &a,
            &Collider::Circle { radius: 10.0 },
            &b,
            &Collider::Circle { radius: 10.0 },
        )
        .unwrap();
        assert!((manifold.normal - DVec2::X).length() < 1e-9);
        assert!((manifold.points[0].penetration - 5.0).abs() < 1e-9);
    }

    #[test]
    fn separated_circles_do_not_collide() {
        let a = body_at(DVec2::ZERO);
        let b = body_at(DVec2::new(25.0, 0.0));
        assert!(
            collide(
                &a,
                &Collider::Circle { radius: 10.0 },
                &b,
                &Collider::Circle { radius: 10.0 },
            )
            .is_none()
        );
    }

    #[test]
    fn circle_rests_on_box() {
        let floor = body_at(DVec2::ZERO);
        let ball = body_at(DVec2::new(0.0, -14.0));
        let manifold = collide(
            &floor,
            &unit_box(10.0),
            &ball,
            &Collider::Circle { radius: 5.0 },
        )
        .unwrap();
        // Normal points from the box towards the ball, i.e. up in
        // y-down coordinates.
        assert!(manifold.normal.y < -0.9);
        assert!((manifold.points[0].penetration - 1.0).abs() < 1e-9);
    }

    #[test]
    fn boxes_produce_two_contact_points() {
        let a = body_at(DVec2::ZERO);
        let b = body_at(DVec2::new(0.0, 18.0));
        let manifold = collide(&a, &unit_box(10.0), &b, &unit_box(10.0)).unwrap();
        assert_eq!(manifold.points.len(), 2);
        assert!(manifold.normal.y > 0.9);
        for point in &manifold.points {
            assert!((point.penetration - 2.0).abs() < 1e-9);
        }
    }

    #[test]
    fn polygon_properties_of_a_square() {
        let points = vec![
            DVec2::new(0.0, 0.0),
            DVec2::new(4.0, 0.0),
            DVec2::new(4.0, 4.0),
            DVec2::new(0.0, 4.0),
        ];
        let (area, centroid, moment) = polygon_properties(&points);
        assert!((area - 16.0).abs() < 1e-9);
        assert!((centroid - DVec2::new(2.0, 2.0)).length() < 1e-9);
        // Square second moment per unit mass: (w^2 + h^2) / 12.
        assert!((moment - 32.0 / 12.0).abs() < 1e-9);
    }

    #[test]
    fn triangulation_covers_the_polygon() {
        let mut points = vec![
            DVec2::new(0.0, 0.0),
            DVec2::new(20.0, 0.0),
            DVec2::new(20.0, 20.0),
            DVec2::new(10.0, 5.0),
            DVec2::new(0.0, 20.0),
        ];
        ensure_winding(&mut points);
        let parts = triangulate(&points);
        assert!(!parts.is_empty());
        let total: f64 = parts
            .iter()
            .map(|part| shoelace_area(&part.points).abs())
            .sum();
        assert!((total - shoelace_area(&points).abs()).abs() < 1e-6);
    }

    #[test]
    fn degenerate_polygons_have_no_parts() {
        let points = vec![
            DVec2::new(0.0, 0.0),
            DVec2::new(1.0, 0.0),
            DVec2::new(2.0, 0.0),
        ];
        assert!(triangulate(&points).is_empty());
    }
}
