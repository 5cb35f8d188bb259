//! 三角形扫描线光栅化
//!
//! 三角形按扫描轴排序后在中间顶点处拆成上下两个梯形，逐扫描线求出跨度并裁剪到图像内。
//! 深度/光照/常量填充沿 Y 扫描，最近顶点部位填充沿 X 扫描。

use glam::DVec2;
use image::{ImageBuffer, Luma, Pixel};

/// 扫描轴
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ScanAxis {
    /// 逐行扫描（扫描坐标为 y）
    Rows,
    /// 逐列扫描（扫描坐标为 x）
    Columns,
}

impl ScanAxis {
    /// 像素坐标 → (扫描, 跨度) 坐标
    #[inline]
    fn to_scan(self, p: DVec2) -> DVec2 {
        match self {
            ScanAxis::Rows => DVec2::new(p.y, p.x),
            ScanAxis::Columns => p,
        }
    }

    /// 图像的 (扫描长度, 跨度长度)
    #[inline]
    fn extent(self, width: u32, height: u32) -> (i64, i64) {
        match self {
            ScanAxis::Rows => (height as i64, width as i64),
            ScanAxis::Columns => (width as i64, height as i64),
        }
    }

    #[inline]
    fn to_pixel(self, scan: i64, span: i64) -> (u32, u32) {
        match self {
            ScanAxis::Rows => (span as u32, scan as u32),
            ScanAxis::Columns => (scan as u32, span as u32),
        }
    }
}

/// 仿射行列式；为零时三角形退化
#[inline]
fn determinant(a: DVec2, b: DVec2, c: DVec2) -> f64 {
    (b.x - c.x) * (a.y - c.y) + (c.y - b.y) * (a.x - c.x)
}

/// 遍历三角形覆盖的每个像素 (x, y)
///
/// 跨度两端都包含在内。含非有限坐标或面积为零的三角形不产生任何像素，
/// 沿扫描轴取整后高度为零的三角形同样跳过。
pub(crate) fn for_each_pixel<F>(pts: [DVec2; 3], width: u32, height: u32, axis: ScanAxis, mut plot: F)
where
    F: FnMut(u32, u32),
{
    if width == 0 || height == 0 {
        return;
    }
    if !pts.iter().all(|p| p.is_finite()) {
        return;
    }
    let det = determinant(pts[0], pts[1], pts[2]);
    if det == 0.0 || !det.is_finite() {
        return;
    }

    let mut v = pts.map(|p| axis.to_scan(p));
    v.sort_by(|p, q| p.x.total_cmp(&q.x));
    let [a, b, c] = v;

    let first = a.x.floor();
    let last = c.x.ceil();
    if first == last {
        return;
    }

    let (scan_len, span_len) = axis.extent(width, height);
    let lo_scan = (first as i64).max(0);
    let hi_scan = (last as i64).min(scan_len - 1);
    let mid = b.x.floor() as i64;

    let mut fill = |scan: i64, lo: f64, hi: f64| {
        let lo = (lo.floor() as i64).max(0);
        let hi = (hi.ceil() as i64).min(span_len - 1);
        for span in lo..=hi {
            let (x, y) = axis.to_pixel(scan, span);
            plot(x, y);
        }
    };

    // 长边 a→c
    let m_long = (c.y - a.y) / (c.x - a.x);
    let b_long = a.y - a.x * m_long;

    let upper = a.x != b.x;
    if upper {
        let mut m_lo = (b.y - a.y) / (b.x - a.x);
        let mut b_lo = a.y - a.x * m_lo;
        let (mut m_hi, mut b_hi) = (m_long, b_long);
        if b.y > c.y {
            std::mem::swap(&mut m_lo, &mut m_hi);
            std::mem::swap(&mut b_lo, &mut b_hi);
        }
        for scan in lo_scan..=mid.min(scan_len - 1) {
            let s = scan as f64;
            fill(scan, m_lo * s + b_lo, m_hi * s + b_hi);
        }
    }

    if b.x != c.x {
        let mut m_lo = (c.y - b.y) / (c.x - b.x);
        let mut b_lo = b.y - b.x * m_lo;
        let (mut m_hi, mut b_hi) = (m_long, b_long);
        if b.y > a.y {
            std::mem::swap(&mut m_lo, &mut m_hi);
            std::mem::swap(&mut b_lo, &mut b_hi);
        }
        let start = mid.max(0).saturating_add(i64::from(upper));
        for scan in start..=hi_scan {
            let s = scan as f64;
            fill(scan, m_lo * s + b_lo, m_hi * s + b_hi);
        }
    }
}

/// 用常量填充三角形
pub(crate) fn paint_constant<P: Pixel>(
    image: &mut ImageBuffer<P, Vec<P::Subpixel>>,
    pts: [DVec2; 3],
    value: P,
) {
    let (width, height) = image.dimensions();
    for_each_pixel(pts, width, height, ScanAxis::Rows, |x, y| {
        image.put_pixel(x, y, value);
    });
}

/// 重心坐标插值三个顶点值，结果截断到 [0, max]
pub(crate) fn paint_barycentric<T, F>(
    image: &mut ImageBuffer<Luma<T>, Vec<T>>,
    pts: [DVec2; 3],
    values: [f64; 3],
    max: f64,
    convert: F,
) where
    Luma<T>: Pixel<Subpixel = T>,
    F: Fn(f64) -> T,
{
    let [a, b, c] = pts;
    let det = determinant(a, b, c);
    if det == 0.0 || !det.is_finite() {
        return;
    }
    let inv = 1.0 / det;
    let (width, height) = image.dimensions();
    for_each_pixel(pts, width, height, ScanAxis::Rows, |x, y| {
        let (px, py) = (x as f64, y as f64);
        let w1 = ((b.x - c.x) * (py - c.y) + (c.y - b.y) * (px - c.x)) * inv;
        let w2 = ((c.x - a.x) * (py - c.y) + (a.y - c.y) * (px - c.x)) * inv;
        let v = w1 * values[0] + w2 * values[1] + (1.0 - w1 - w2) * values[2];
        image.put_pixel(x, y, Luma([convert(v.clamp(0.0, max))]));
    });
}

/// 最近顶点填充：每个像素取像素距离最近的顶点标签（沿 X 扫描）
pub(crate) fn paint_nearest(
    image: &mut ImageBuffer<Luma<u8>, Vec<u8>>,
    pts: [DVec2; 3],
    labels: [u8; 3],
) {
    let (width, height) = image.dimensions();
    for_each_pixel(pts, width, height, ScanAxis::Columns, |x, y| {
        let p = DVec2::new(x as f64, y as f64);
        let [da, db, dc] = pts.map(|v| v.distance_squared(p));
        let label = if da < db && da < dc {
            labels[0]
        } else if db < dc {
            labels[1]
        } else {
            labels[2]
        };
        image.put_pixel(x, y, Luma([label]));
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::GrayImage;

    fn right_triangle() -> [DVec2; 3] {
        [DVec2::new(0.0, 0.0), DVec2::new(10.0, 0.0), DVec2::new(0.0, 10.0)]
    }

    fn inside_right_triangle(x: u32, y: u32) -> bool {
        x + y <= 10
    }

    #[test]
    fn test_constant_fill_coverage() {
        let mut image = GrayImage::new(20, 20);
        paint_constant(&mut image, right_triangle(), Luma([7u8]));
        for (x, y, p) in image.enumerate_pixels() {
            let expected = if inside_right_triangle(x, y) { 7 } else { 0 };
            assert_eq!(p[0], expected, "pixel ({}, {})", x, y);
        }
    }

    #[test]
    fn test_coverage_independent_of_vertex_order() {
        let [a, b, c] = right_triangle();
        for pts in [[a, b, c], [c, b, a], [b, c, a], [c, a, b]] {
            let mut count = 0;
            for_each_pixel(pts, 20, 20, ScanAxis::Rows, |x, y| {
                assert!(inside_right_triangle(x, y));
                count += 1;
            });
            assert_eq!(count, 66);
        }
    }

    #[test]
    fn test_split_triangle_coverage() {
        // 中间顶点 (10, 5) 把三角形分成上下两个梯形
        let pts = [DVec2::new(0.0, 0.0), DVec2::new(10.0, 5.0), DVec2::new(0.0, 10.0)];
        let mut image = GrayImage::new(20, 20);
        paint_constant(&mut image, pts, Luma([1u8]));
        let mut count = 0;
        for (x, y, p) in image.enumerate_pixels() {
            let inside = y <= 10 && x <= 2 * y.min(10 - y);
            assert_eq!(p[0] == 1, inside, "pixel ({}, {})", x, y);
            count += p[0] as usize;
        }
        assert_eq!(count, 61);
    }

    #[test]
    fn test_nearest_fill_coverage() {
        let mut image = GrayImage::from_pixel(20, 20, Luma([255]));
        paint_nearest(&mut image, right_triangle(), [1, 2, 3]);
        for (x, y, p) in image.enumerate_pixels() {
            if inside_right_triangle(x, y) {
                assert!(p[0] < 255, "pixel ({}, {}) not painted", x, y);
            } else {
                assert_eq!(p[0], 255, "pixel ({}, {}) painted", x, y);
            }
        }
        assert_eq!(image.get_pixel(0, 0)[0], 1);
        assert_eq!(image.get_pixel(10, 0)[0], 2);
        assert_eq!(image.get_pixel(0, 10)[0], 3);
        assert_eq!(image.get_pixel(8, 1)[0], 2);
    }

    #[test]
    fn test_barycentric_interpolation() {
        let mut image: ImageBuffer<Luma<f32>, Vec<f32>> = ImageBuffer::new(20, 20);
        paint_barycentric(&mut image, right_triangle(), [1.0, 11.0, 21.0], 255.0, |v| v as f32);
        // 值 = 1 + x + 2y
        for (x, y, p) in image.enumerate_pixels() {
            if inside_right_triangle(x, y) {
                let expected = 1.0 + x as f32 + 2.0 * y as f32;
                assert!((p[0] - expected).abs() < 1e-4, "pixel ({}, {})", x, y);
            } else {
                assert_eq!(p[0], 0.0);
            }
        }
    }

    #[test]
    fn test_barycentric_clamps() {
        let mut image: ImageBuffer<Luma<u8>, Vec<u8>> = ImageBuffer::new(20, 20);
        paint_barycentric(&mut image, right_triangle(), [-50.0, 500.0, 500.0], 255.0, |v| v as u8);
        assert_eq!(image.get_pixel(0, 0)[0], 0);
        assert_eq!(image.get_pixel(10, 0)[0], 255);
    }

    #[test]
    fn test_degenerate_triangles_paint_nothing() {
        let flat_y = [DVec2::new(1.0, 5.0), DVec2::new(8.0, 5.0), DVec2::new(15.0, 5.0)];
        let flat_x = [DVec2::new(4.0, 1.0), DVec2::new(4.0, 9.0), DVec2::new(4.0, 3.0)];
        let half_row = [DVec2::new(1.0, 5.5), DVec2::new(8.0, 5.5), DVec2::new(3.0, 5.5)];
        let nan = [DVec2::new(f64::NAN, 0.0), DVec2::new(8.0, 5.0), DVec2::new(3.0, 9.0)];
        for pts in [flat_y, flat_x, half_row, nan] {
            for axis in [ScanAxis::Rows, ScanAxis::Columns] {
                let mut count = 0;
                for_each_pixel(pts, 20, 20, axis, |_, _| count += 1);
                assert_eq!(count, 0, "{:?} {:?}", pts, axis);
            }
        }

        let mut image = GrayImage::from_pixel(20, 20, Luma([255]));
        paint_nearest(&mut image, flat_x, [0, 1, 2]);
        assert!(image.pixels().all(|p| p[0] == 255));
    }

    #[test]
    fn test_clipped_to_image() {
        let pts = [DVec2::new(-30.0, -30.0), DVec2::new(100.0, -30.0), DVec2::new(-30.0, 100.0)];
        let mut count = 0;
        for_each_pixel(pts, 20, 20, ScanAxis::Rows, |x, y| {
            assert!(x < 20 && y < 20);
            count += 1;
        });
        assert_eq!(count, 400);

        for_each_pixel(right_triangle(), 0, 0, ScanAxis::Rows, |_, _| panic!("empty image"));
    }

    #[test]
    fn test_far_middle_vertex_saturates() {
        // 靠近 z = 0 的点投影后坐标极大，取整饱和到 i64::MAX
        let pts = [DVec2::new(0.0, 0.0), DVec2::new(8.0, 1e300), DVec2::new(2.0, 2e300)];
        for axis in [ScanAxis::Rows, ScanAxis::Columns] {
            let swapped = match axis {
                ScanAxis::Rows => pts,
                ScanAxis::Columns => pts.map(|p| DVec2::new(p.y, p.x)),
            };
            let mut count = 0;
            for_each_pixel(swapped, 20, 20, axis, |x, y| {
                assert!(x < 20 && y < 20);
                count += 1;
            });
            assert!(count > 0, "{:?}", axis);
        }
    }
}
