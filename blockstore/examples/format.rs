use blockstore::{FileBlockDeviceBuilder, Volume, VolumeParams};

pub fn main() {
    let image = tempfile::tempfile().unwrap();
    let dev = FileBlockDeviceBuilder::from(image)
        .with_block_size(512)
        .with_block_count(2048)
        .clear_medium(true)
        .build()
        .expect("could not initialize disk image");

    let mut vol = Volume::format(dev, VolumeParams::default()).expect("format failed");
    println!("{} free clusters after format", vol.free_clusters());

    let clusters = vol.alloc_clusters(4).expect("allocation failed");
    println!("allocated clusters {:?}", clusters);
    for &c in &clusters {
        vol.write_cluster(c, &vec![0xab; 4096]).expect("write failed");
    }

    vol.release_clusters(&clusters[2..]);
    println!("{} free clusters after release", vol.free_clusters());
    vol.unmount().expect("unmount failed");
}
