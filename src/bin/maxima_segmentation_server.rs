// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::net::SocketAddr;
use std::time::Instant;

use clap::Parser;
use env_logger;
use imageproc::rect::Rect;
use log::{debug, info, warn};

use ::maxima_segmentation::error::SliceError;
use ::maxima_segmentation::pipeline::{self, CancelFlag, NoProgress};
use ::maxima_segmentation::plane::FloatImage;
use ::maxima_segmentation::rank_filter::CircularRankFilter;
use ::maxima_segmentation::region_mask::RegionMask;
use crate::maxima_segmentation::maxima_segmentation_server::{
    MaximaSegmentation, MaximaSegmentationServer};
use crate::maxima_segmentation::slice_request::Roi;

use tonic_web::GrpcWebLayer;

pub mod maxima_segmentation {
    // The string specified here must match the proto package name.
    tonic::include_proto!("maxima_segmentation");
}

struct MyMaximaSegmentation {
    // No server state; each request is one slice.
}

fn plane_from_proto(plane: maxima_segmentation::Plane, what: &str)
                    -> Result<FloatImage, tonic::Status> {
    if plane.width <= 0 || plane.height <= 0 {
        return Err(tonic::Status::invalid_argument(format!(
            "{} has invalid size {}x{}", what, plane.width, plane.height)));
    }
    let num_samples = plane.samples.len();
    FloatImage::from_raw(plane.width as u32, plane.height as u32, plane.samples)
        .ok_or_else(|| tonic::Status::invalid_argument(format!(
            "{} is {}x{} but has {} samples",
            what, plane.width, plane.height, num_samples)))
}

fn rect_from_proto(rect: &maxima_segmentation::RectangleRoi)
                   -> Result<Rect, tonic::Status> {
    if rect.width <= 0 || rect.height <= 0 {
        return Err(tonic::Status::invalid_argument(format!(
            "Invalid rectangle {:?}", rect)));
    }
    Ok(Rect::at(rect.origin_x, rect.origin_y)
       .of_size(rect.width as u32, rect.height as u32))
}

fn mask_from_proto(roi: Roi) -> Result<RegionMask, tonic::Status> {
    match roi {
        Roi::Rectangle(rect) => Ok(RegionMask::Rectangle(rect_from_proto(&rect)?)),
        Roi::Polygon(polygon) => {
            let points: Vec<(f32, f32)> =
                polygon.vertices.iter().map(|v| (v.x, v.y)).collect();
            Ok(RegionMask::polygon_from_points(&points))
        },
        Roi::Ellipse(ellipse) => {
            let Some(bounds) = ellipse.bounds else {
                return Err(tonic::Status::invalid_argument(
                    "Ellipse 'bounds' field is missing"));
            };
            Ok(RegionMask::Ellipse(rect_from_proto(&bounds)?))
        },
        Roi::Points(point_set) => {
            let mut pixels = Vec::with_capacity(point_set.pixels.len());
            for p in &point_set.pixels {
                if p.x < 0 || p.y < 0 {
                    return Err(tonic::Status::invalid_argument(format!(
                        "Invalid point ({}, {})", p.x, p.y)));
                }
                pixels.push((p.x as u32, p.y as u32));
            }
            Ok(RegionMask::Points(pixels))
        },
    }
}

// Fields left unset in the request keep their library defaults.
fn params_from_proto(params: Option<maxima_segmentation::SliceParameters>)
                     -> pipeline::SliceParameters {
    let defaults = pipeline::SliceParameters::default();
    let Some(p) = params else {
        return defaults;
    };
    pipeline::SliceParameters{
        despeckle_radius: p.despeckle_radius.unwrap_or(defaults.despeckle_radius),
        smooth_radius: p.smooth_radius.unwrap_or(defaults.smooth_radius),
        tolerance: p.tolerance.unwrap_or(defaults.tolerance),
        threshold: p.threshold.unwrap_or(defaults.threshold),
        exclude_maxima_on_edges:
            p.exclude_maxima_on_edges.unwrap_or(defaults.exclude_maxima_on_edges),
        exclude_segments_on_edges:
            p.exclude_segments_on_edges.unwrap_or(defaults.exclude_segments_on_edges),
        is_edm: p.is_edm.unwrap_or(defaults.is_edm),
        light_background: p.light_background.unwrap_or(defaults.light_background),
        maxima_only: p.maxima_only.unwrap_or(defaults.maxima_only),
        ..defaults
    }
}

#[tonic::async_trait]
impl MaximaSegmentation for MyMaximaSegmentation {
    async fn process_slice(
        &self, request: tonic::Request<maxima_segmentation::SliceRequest>)
        -> Result<tonic::Response<maxima_segmentation::SliceResult>, tonic::Status>
    {
        let rpc_start = Instant::now();
        let req: maxima_segmentation::SliceRequest = request.into_inner();

        let Some(plane) = req.plane else {
            return Err(tonic::Status::invalid_argument(
                "Request 'plane' field is missing"));
        };
        let plane = plane_from_proto(plane, "plane")?;
        let seg_plane = match req.segmentation_plane {
            Some(p) => Some(plane_from_proto(p, "segmentation_plane")?),
            None => None,
        };
        let mask = match req.roi {
            Some(roi) => Some(mask_from_proto(roi)?),
            None => None,
        };
        let params = params_from_proto(req.parameters);
        debug!("ProcessSlice {}x{} with {:?}", plane.width(), plane.height(), params);

        let result = tokio::task::spawn_blocking(move || {
            pipeline::process(plane, seg_plane, &params, mask.as_ref(),
                              &CircularRankFilter, &CancelFlag::new(), &NoProgress)
        }).await.map_err(|e| tonic::Status::internal(format!("Slice task failed: {}", e)))?;
        let output = match result {
            Ok(output) => output,
            Err(SliceError::InvalidInput(msg)) => {
                return Err(tonic::Status::invalid_argument(msg));
            },
            Err(e) => {
                warn!("ProcessSlice failed: {}", e);
                return Err(tonic::Status::internal(e.to_string()));
            },
        };

        let points = output.points.points.iter().map(|p| maxima_segmentation::Point{
            id: p.id as i32,
            x: p.x as i32,
            y: p.y as i32,
        }).collect();
        let label_image = output.label.map(|label| {
            let (width, height) = label.dimensions();
            maxima_segmentation::LabelImage{
                width: width as i32,
                height: height as i32,
                image_data: label.to_gray_image().into_raw(),
                num_basins: label.num_basins() as i32,
                basin_areas: label.basin_areas().iter().map(|a| *a as i32).collect(),
                binary_mask: label.to_binary_mask().into_raw(),
            }
        });
        let algorithm_time = prost_types::Duration::try_from(rpc_start.elapsed())
            .map_err(|e| tonic::Status::internal(e.to_string()))?;
        let response = maxima_segmentation::SliceResult{
            points,
            count: output.count as i32,
            label_image,
            seeds_recomputed: output.seeds_recomputed,
            algorithm_time: Some(algorithm_time),
        };
        Ok(tonic::Response::new(response))
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about=None)]
struct Args {
    /// Port that the gRPC server listens on.
    #[arg(short, long, default_value_t = 50052)]
    port: u16,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    // Listen on any address for the given port.
    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    info!("MaximaSegmentationServer listening on {}", addr);

    tonic::transport::Server::builder()
        .accept_http1(true)
        .layer(GrpcWebLayer::new())
        .add_service(MaximaSegmentationServer::new(MyMaximaSegmentation{}))
        .serve(addr)
        .await?;
    Ok(())
}
