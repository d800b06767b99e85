mod common;

use approx::assert_relative_eq;
use basin_rs::basin::hand_class;
use basin_rs::hillslope::Aggregation;
use basin_rs::stream::{Stream, StreamVertex, nearest_point};
use basin_rs::{Basin, BasinError};
use common::{edge_path, valley, valley_basin};

#[test]
fn uniform_field_survives_aggregation_round_trip() {
    let basin = valley_basin(3.0);
    let p = basin.partition(3.0).unwrap();
    assert!(p.count() > 1);
    for v in [0.0, 1.0, 0.1, -7.25, 1234.5678] {
        let field = vec![v; basin.ncells()];
        let hills = p.cells_to_hillslopes(&field, Aggregation::Mean, None).unwrap();
        assert_eq!(hills.len(), p.count());
        assert_eq!(p.hillslopes_to_cells(&hills).unwrap(), field);
    }
}

#[test]
fn every_cell_has_exactly_one_hillslope() {
    let basin = valley_basin(3.0);
    let p = basin.partition(3.0).unwrap();
    let count = p.count() as u32;
    assert!(p.own.iter().all(|&h| (1..=count).contains(&h)));

    let mut seen = vec![false; basin.ncells()];
    for id in 1..=count {
        let cells = p.cells_of(id);
        assert!(!cells.is_empty(), "hillslope {} owns no cells", id);
        for i in cells {
            assert!(!seen[i], "cell {} owned twice", i);
            seen[i] = true;
        }
    }
    assert!(seen.iter().all(|&s| s));
}

#[test]
fn hillslope_drainage_reaches_the_outlet() {
    let basin = valley_basin(3.0);
    let p = basin.partition(3.0).unwrap();
    assert_eq!(p.count(), 30);
    for id in 1..=p.count() as u32 {
        let hops = p.hops_to_outlet(id).unwrap();
        assert!(hops <= p.count());
    }
    let order = p.routing_order().unwrap();
    assert_eq!(order.len(), p.count());
    assert_eq!(*order.last().unwrap(), p.outlet());
}

#[test]
fn hillslope_areas_add_up_to_the_basin() {
    for threshold in [1.0, 3.0, 5.0, 50.0] {
        let basin = valley_basin(threshold);
        let p = basin.partition(threshold).unwrap();
        let dxp = basin.grid().dxp();
        let total: f64 = p.areas(dxp).iter().sum();
        assert_relative_eq!(total, basin.ncells() as f64 * dxp * dxp, max_relative = 1e-12);
        assert_relative_eq!(total / 1e6, basin.area_km2(), max_relative = 1e-12);
    }
}

#[test]
fn hand_classes_from_literals() {
    assert_eq!(hand_class(3.0, 0.05), 1);
    assert_eq!(hand_class(10.0, 0.05), 2);
    assert_eq!(hand_class(10.0, 0.5), 2);
    assert_eq!(hand_class(20.0, 0.05), 4);
    assert_eq!(hand_class(20.0, 0.10), 3);
}

#[test]
fn edge_path_basin_is_one_hillslope() {
    let (dem, dir) = edge_path();
    let basin = Basin::delineate("corner", 5.0, 5.0, dem, dir, 1.0, None).unwrap();
    assert_eq!(basin.ncells(), 10);
    let channel = basin.channel();
    assert_eq!(channel.iter().filter(|&&c| c).count(), 5);
    let p = basin.partition(1.0).unwrap();
    assert_eq!(p.count(), 1);
    assert_eq!(p.dest, vec![0]);
}

#[test]
fn snapping_picks_the_closest_vertex() {
    let points = [(5.0, 0.0), (0.0, 3.0), (-8.0, 0.0), (0.0, -10.0)];
    assert_eq!(nearest_point(&points, 0.0, 0.0), Some(1));

    let (dem, dir) = valley();
    let mut stream = Stream::trace("main", 165.0, 285.0, dem, dir).unwrap();
    stream.vertices = points
        .iter()
        .enumerate()
        .map(|(i, &(x, y))| StreamVertex {
            x,
            y,
            elevation: 0.0,
            distance: i as f64,
        })
        .collect();
    assert_eq!(stream.snap(0.0, 0.0), (0.0, 3.0));
}

#[test]
fn valley_stream_runs_down_the_centre_column() {
    let (dem, dir) = valley();
    let stream = Stream::trace("main", 165.0, 285.0, dem, dir).unwrap();
    assert_eq!(stream.len(), 10);
    assert_relative_eq!(stream.length(), 270.0);
    assert!(stream.vertices.windows(2).all(|w| w[1].elevation < w[0].elevation));
}

#[test]
fn pour_point_outside_the_raster_fails() {
    let (dem, dir) = valley();
    assert!(matches!(
        Basin::delineate("nowhere", -50.0, 15.0, dem, dir, 5.0, None),
        Err(BasinError::Tracing(_))
    ));
}

#[test]
fn rasters_from_different_grids_are_rejected() {
    let (dem, _) = valley();
    let (_, dir) = edge_path();
    assert!(matches!(
        Basin::delineate("mixed", 5.0, 5.0, dem, dir, 1.0, None),
        Err(BasinError::ConfigurationMismatch(_))
    ));
}

#[test]
fn geomorphology_of_the_valley() {
    let mut basin = valley_basin(5.0);
    let geo = basin.compute_geomorphology().unwrap().clone();
    assert_relative_eq!(geo.area_km2, 0.09, max_relative = 1e-12);
    assert_relative_eq!(geo.main_channel_length_km, 0.27, max_relative = 1e-12);
    assert!(geo.h_max > geo.h_min);
    let tc = basin.tc.as_ref().unwrap();
    assert_eq!(tc.len(), 8);
    assert!(tc.values().all(|t| t.is_finite()));
}

#[test]
fn hypsometric_curve_of_the_valley() {
    let basin = valley_basin(5.0);
    let curve = basin.hypsometric_curve(10).unwrap();
    assert_eq!(curve.basin.len(), 11);
    assert_relative_eq!(curve.basin[0].1, 100.0);
    assert!(curve.basin.windows(2).all(|w| w[0].0 < w[1].0 && w[0].1 >= w[1].1));
    assert!(curve.basin[10].1 > 0.0);

    let (last_distance, _) = *curve.main_stream.last().unwrap();
    assert_relative_eq!(last_distance, 270.0, max_relative = 1e-12);
    assert!(curve.main_stream.first().unwrap().1 > curve.main_stream.last().unwrap().1);
}
