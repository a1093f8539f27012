mod common;

use std::collections::HashSet;

use medimg_ingest::{
    enums::{Axis, Dimensionality, ImageType, SourceFormat},
    ingest::IngestSettings,
    record::{Linkage, PlaneExtent, SlicePosition},
    volume::SliceCounts,
};

use common::{
    Harness, children_along, decode_png, dicom_bytes, gzip, insert_linked, nifti_plane, nifti_volume, png_bytes, request,
    voi_lut_sequence,
};

#[tokio::test]
async fn raster_upload_is_stored_verbatim() {
    let h = Harness::new().await;
    let png = png_bytes(6, 4);

    let graph = h.ingestor.ingest(request(png.clone(), "photo.PNG", "photo")).await.unwrap();

    assert_eq!(graph.root.format, SourceFormat::Raster);
    assert_eq!(graph.root.dim, Dimensionality::TwoD);
    assert!(graph.children.is_empty());
    assert!(graph.root.storage_key.starts_with("hidoc2/images/"));
    assert!(graph.root.storage_key.ends_with(".png"));
    assert_eq!(h.blob(&graph.root.storage_key), png);
    assert_eq!(graph.root.size_bytes, png.len() as u64);
    assert_eq!(graph.root.extent, Some(PlaneExtent { width: 6, height: 4 }));
    assert_eq!(h.blobs.put_count(), 1);
}

#[tokio::test]
async fn undecodable_raster_is_still_stored() {
    let h = Harness::new().await;
    let bytes = b"plain text, no image container here".to_vec();

    let graph = h.ingestor.ingest(request(bytes.clone(), "notes.txt", "notes")).await.unwrap();

    assert_eq!(graph.root.format, SourceFormat::Raster);
    assert_eq!(graph.root.extent, None);
    assert!(graph.root.storage_key.ends_with(".txt"));
    assert_eq!(h.blob(&graph.root.storage_key), bytes);
}

#[tokio::test]
async fn single_frame_dicom_gets_one_preview() {
    let h = Harness::new().await;
    let samples: Vec<u16> = (0..12).map(|v| v * 100).collect();
    let dicom = dicom_bytes(1, 3, 4, &samples, Vec::new());

    let graph = h.ingestor.ingest(request(dicom.clone(), "chest.dcm", "chest")).await.unwrap();

    assert_eq!(graph.root.format, SourceFormat::StructuredMetadata);
    assert_eq!(graph.root.dim, Dimensionality::TwoD);
    assert_eq!(graph.root.extent, Some(PlaneExtent { width: 4, height: 3 }));
    assert!(graph.root.storage_key.ends_with(".dcm"));
    assert_eq!(h.blob(&graph.root.storage_key), dicom);

    assert_eq!(graph.children.len(), 1);
    let preview = &graph.children[0];
    assert_eq!(preview.name, "chest_preview");
    assert_eq!(preview.parent_id, Some(graph.root.id));
    assert_eq!(preview.format, SourceFormat::Raster);
    assert_eq!(preview.dim, Dimensionality::TwoD);
    assert_eq!(preview.slice, None);
    assert!(preview.storage_key.ends_with(".png"));

    let image = decode_png(&h.blob(&preview.storage_key));
    assert_eq!(image.dimensions(), (4, 3));
    assert_eq!(image.get_pixel(0, 0).0[0], 0);
    assert_eq!(image.get_pixel(3, 2).0[0], 255);
}

#[tokio::test]
async fn large_dicom_preview_spans_full_gray_range() {
    let h = Harness::new().await;
    let samples: Vec<u16> = (0..512 * 512).map(|i| (i % 4096) as u16).collect();
    let dicom = dicom_bytes(1, 512, 512, &samples, Vec::new());

    let graph = h.ingestor.ingest(request(dicom, "big.dcm", "big")).await.unwrap();

    let image = decode_png(&h.blob(&graph.children[0].storage_key));
    assert_eq!(image.dimensions(), (512, 512));
    let min = image.pixels().map(|p| p.0[0]).min().unwrap();
    let max = image.pixels().map(|p| p.0[0]).max().unwrap();
    assert_eq!((min, max), (0, 255));
}

#[tokio::test]
async fn two_dimensional_nifti_gets_one_preview_in_row_major_orientation() {
    let h = Harness::new().await;
    let nifti = nifti_plane(5, 3, |x, _| x as f32);

    let graph = h.ingestor.ingest(request(nifti, "plane.nii", "plane")).await.unwrap();

    assert_eq!(graph.root.format, SourceFormat::Volumetric);
    assert_eq!(graph.root.dim, Dimensionality::TwoD);
    assert!(graph.root.storage_key.ends_with(".nii"));
    assert_eq!(graph.root.extent, Some(PlaneExtent { width: 5, height: 3 }));
    assert_eq!(graph.children.len(), 1);

    let image = decode_png(&h.blob(&graph.children[0].storage_key));
    assert_eq!(image.dimensions(), (5, 3));
    let first_row: Vec<u8> = (0..5).map(|x| image.get_pixel(x, 0).0[0]).collect();
    assert_eq!(first_row, vec![0, 63, 127, 191, 255]);
}

#[tokio::test]
async fn nifti_volume_is_decomposed_along_every_axis() {
    let h = Harness::new().await;
    let nifti = gzip(&nifti_volume(4, 3, 2, |x, _, _| x as f32));

    let graph = h.ingestor.ingest(request(nifti, "head.nii.gz", "head")).await.unwrap();

    assert_eq!(graph.root.dim, Dimensionality::ThreeD);
    assert!(graph.root.storage_key.ends_with(".nii.gz"));
    assert_eq!(graph.root.slice_counts, Some(SliceCounts { x: 4, y: 3, z: 2 }));
    assert_eq!(graph.children.len(), 4 + 3 + 2);

    let positions: Vec<SlicePosition> = graph.children.iter().filter_map(|c| c.slice).collect();
    let mut sorted = positions.clone();
    sorted.sort();
    assert_eq!(positions, sorted);

    for (axis, count, plane) in [(Axis::X, 4, "sagittal"), (Axis::Y, 3, "coronal"), (Axis::Z, 2, "axial")] {
        let children = children_along(&graph, axis);
        assert_eq!(children.len(), count);
        for (i, child) in children.iter().enumerate() {
            assert_eq!(child.name, format!("head_{plane}_{i}"));
            assert_eq!(child.parent_id, Some(graph.root.id));
            assert_eq!(child.linkage, Linkage::default());
        }
    }

    // z: rows y, columns x; x: rows z, columns y; y: rows z, columns x
    let dims = |axis| decode_png(&h.blob(&children_along(&graph, axis)[0].storage_key)).dimensions();
    assert_eq!(dims(Axis::Z), (4, 3));
    assert_eq!(dims(Axis::X), (3, 2));
    assert_eq!(dims(Axis::Y), (4, 2));

    let axial = decode_png(&h.blob(&children_along(&graph, Axis::Z)[0].storage_key));
    let first_row: Vec<u8> = (0..4).map(|x| axial.get_pixel(x, 0).0[0]).collect();
    assert_eq!(first_row, vec![0, 85, 170, 255]);
}

#[tokio::test]
async fn large_volume_yields_one_slice_per_index_per_axis() {
    let h = Harness::new().await;
    let nifti = nifti_volume(100, 100, 50, |x, y, z| (x + y + z) as f32);

    let graph = h.ingestor.ingest(request(nifti, "brain.nii", "brain")).await.unwrap();

    assert_eq!(graph.children.len(), 250);
    let keys: HashSet<&str> = std::iter::once(&graph.root)
        .chain(&graph.children)
        .map(|r| r.storage_key.as_str())
        .collect();
    assert_eq!(keys.len(), 251);
    assert_eq!(h.blobs.len(), 251);
    assert_eq!(h.image_count().await, 251);
}

#[tokio::test]
async fn multi_frame_dicom_is_a_volume() {
    let h = Harness::new().await;
    let (frames, rows, columns) = (3, 4, 5);
    let samples: Vec<u16> = (0..frames * rows * columns).map(|i| i as u16).collect();
    let dicom = dicom_bytes(frames, rows, columns, &samples, Vec::new());

    let graph = h.ingestor.ingest(request(dicom, "cine.dcm", "cine")).await.unwrap();

    assert_eq!(graph.root.format, SourceFormat::StructuredMetadata);
    assert_eq!(graph.root.dim, Dimensionality::ThreeD);
    assert_eq!(graph.root.slice_counts, Some(SliceCounts { x: 5, y: 4, z: 3 }));
    assert_eq!(graph.children.len(), 12);

    let dims = |axis| decode_png(&h.blob(&children_along(&graph, axis)[0].storage_key)).dimensions();
    assert_eq!(dims(Axis::Z), (5, 4));
    assert_eq!(dims(Axis::X), (4, 3));
    assert_eq!(dims(Axis::Y), (5, 3));
}

#[tokio::test]
async fn voi_lookup_table_reaches_every_slice_of_a_volume() {
    let h = Harness::new().await;
    // value = 4z + 2y + x; the table maps even values to 255 and odd ones to 0
    let samples: Vec<u16> = (0..8).collect();
    let lut = voi_lut_sequence(0, 8, &[255, 0, 255, 0, 255, 0, 255, 0]);
    let dicom = dicom_bytes(2, 2, 2, &samples, vec![lut]);

    let graph = h.ingestor.ingest(request(dicom, "lut.dcm", "lut")).await.unwrap();

    assert_eq!(graph.children.len(), 2 + 2 + 2);
    for child in &graph.children {
        let slice = child.slice.expect("slice position");
        let png = decode_png(&h.blob(&child.storage_key));
        for (px, _, pixel) in png.enumerate_pixels() {
            let x = if slice.axis == Axis::X { slice.index } else { px as usize };
            let expected = if x % 2 == 0 { 255 } else { 0 };
            assert_eq!(pixel.0[0], expected, "{:?} slice {} at column {px}", slice.axis, slice.index);
        }
    }
}

#[tokio::test]
async fn linked_root_keeps_linkage_and_children_do_not() {
    let h = Harness::new().await;
    insert_linked(&h.store, "medical_case", 5).await;
    insert_linked(&h.store, "patient", 11).await;

    let mut req = request(nifti_volume(2, 2, 2, |x, y, z| (x * y * z) as f32), "v.nii", "v");
    req.linkage = Linkage {
        patient_id: Some(11),
        department_id: None,
        case_id: Some(5),
    };
    req.note = Some("follow-up".to_owned());
    req.image_type = ImageType::Mri;

    let graph = h.ingestor.ingest(req).await.unwrap();

    assert_eq!(graph.root.linkage.case_id, Some(5));
    assert_eq!(graph.root.linkage.patient_id, Some(11));
    assert_eq!(graph.root.note.as_deref(), Some("follow-up"));
    for child in &graph.children {
        assert!(child.linkage.is_empty());
        assert_eq!(child.note, None);
        assert_eq!(child.image_type, ImageType::Mri);
        assert_eq!(child.creator_id, 7);
    }
}

#[tokio::test]
async fn scratch_directory_is_empty_after_requests() {
    let scratch = tempfile::tempdir().unwrap();
    let h = Harness::with_settings(IngestSettings {
        upload_concurrency: 2,
        scratch_dir: Some(scratch.path().to_path_buf()),
    })
    .await;

    h.ingestor
        .ingest(request(nifti_volume(3, 3, 3, |x, _, _| x as f32), "a.nii", "a"))
        .await
        .unwrap();
    let mut truncated = nifti_volume(3, 3, 3, |x, _, _| x as f32);
    truncated.truncate(400);
    assert!(h.ingestor.ingest(request(truncated, "b.nii", "b")).await.is_err());

    assert_eq!(std::fs::read_dir(scratch.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn concurrent_requests_do_not_share_keys() {
    let h = Harness::new().await;
    let first = request(nifti_volume(3, 2, 2, |x, _, _| x as f32), "a.nii", "a");
    let second = request(dicom_bytes(2, 2, 2, &[1, 2, 3, 4, 5, 6, 7, 8], Vec::new()), "b.dcm", "b");

    let (a, b) = tokio::join!(h.ingestor.ingest(first), h.ingestor.ingest(second));
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_ne!(a.root.id, b.root.id);
    let keys: HashSet<String> = [&a, &b]
        .into_iter()
        .flat_map(|g| std::iter::once(&g.root).chain(&g.children))
        .map(|r| r.storage_key.clone())
        .collect();
    assert_eq!(keys.len(), 2 + a.children.len() + b.children.len());
}
