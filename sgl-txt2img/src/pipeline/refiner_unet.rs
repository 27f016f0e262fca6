//! SDXL refiner UNet assembled from `candle-transformers` blocks.
//!
//! The refiner's mid-block stacks four transformer layers while its last stage
//! has no cross-attention. `UNet2DConditionModelConfig` derives the mid-block
//! depth from the last stage, so this layout is built block by block here.

use candle_core::{Module, Result, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, GroupNorm, VarBuilder};
use candle_transformers::models::stable_diffusion::{
    embeddings::{TimestepEmbedding, Timesteps},
    unet_2d::BlockConfig,
    unet_2d_blocks::{
        CrossAttnDownBlock2D, CrossAttnDownBlock2DConfig, CrossAttnUpBlock2D,
        CrossAttnUpBlock2DConfig, DownBlock2D, DownBlock2DConfig, UNetMidBlock2DCrossAttn,
        UNetMidBlock2DCrossAttnConfig, UpBlock2D, UpBlock2DConfig,
    },
};

#[derive(Debug, Clone)]
pub struct RefinerUNetConfig {
    pub blocks: Vec<BlockConfig>,
    /// Transformer layers in the mid-block, independent of the last stage.
    pub mid_transformer_layers: usize,
    pub cross_attention_dim: usize,
    pub layers_per_block: usize,
    pub downsample_padding: usize,
    pub flip_sin_to_cos: bool,
    pub freq_shift: f64,
    pub norm_eps: f64,
    pub norm_num_groups: usize,
    pub use_linear_projection: bool,
}

impl RefinerUNetConfig {
    /// Layout of the published refiner checkpoint: cross-attention only in the
    /// two middle stages, conditioned on the second text encoder alone.
    pub fn sdxl() -> Self {
        let bc = |out_channels, use_cross_attn, attention_head_dim| BlockConfig {
            out_channels,
            use_cross_attn,
            attention_head_dim,
        };
        Self {
            blocks: vec![
                bc(384, None, 6),
                bc(768, Some(4), 12),
                bc(1536, Some(4), 24),
                bc(1536, None, 24),
            ],
            mid_transformer_layers: 4,
            cross_attention_dim: 1280,
            layers_per_block: 2,
            downsample_padding: 1,
            flip_sin_to_cos: true,
            freq_shift: 0.,
            norm_eps: 1e-5,
            norm_num_groups: 32,
            use_linear_projection: true,
        }
    }
}

enum DownBlock {
    Basic(DownBlock2D),
    CrossAttn(CrossAttnDownBlock2D),
}

enum UpBlock {
    Basic(UpBlock2D),
    CrossAttn(CrossAttnUpBlock2D),
}

impl UpBlock {
    fn resnets(&self) -> usize {
        match self {
            UpBlock::Basic(b) => b.resnets.len(),
            UpBlock::CrossAttn(b) => b.upblock.resnets.len(),
        }
    }
}

pub struct RefinerUNet {
    conv_in: Conv2d,
    time_proj: Timesteps,
    time_embedding: TimestepEmbedding,
    down_blocks: Vec<DownBlock>,
    mid_block: UNetMidBlock2DCrossAttn,
    up_blocks: Vec<UpBlock>,
    conv_norm_out: GroupNorm,
    conv_out: Conv2d,
}

impl RefinerUNet {
    pub fn new(
        vs: VarBuilder,
        in_channels: usize,
        out_channels: usize,
        use_flash_attn: bool,
        config: &RefinerUNetConfig,
    ) -> Result<Self> {
        let blocks = &config.blocks;
        let n_blocks = blocks.len();
        if n_blocks == 0 {
            candle_core::bail!("refiner unet needs at least one block");
        }
        let b_channels = blocks[0].out_channels;
        let last = &blocks[n_blocks - 1];
        let time_embed_dim = b_channels * 4;
        let conv_cfg = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };

        let conv_in = candle_nn::conv2d(in_channels, b_channels, 3, conv_cfg, vs.pp("conv_in"))?;
        let time_proj = Timesteps::new(b_channels, config.flip_sin_to_cos, config.freq_shift);
        let time_embedding =
            TimestepEmbedding::new(vs.pp("time_embedding"), b_channels, time_embed_dim)?;

        let vs_db = vs.pp("down_blocks");
        let mut down_blocks = Vec::with_capacity(n_blocks);
        for (i, block) in blocks.iter().enumerate() {
            let in_channels = if i > 0 {
                blocks[i - 1].out_channels
            } else {
                b_channels
            };
            let db_cfg = DownBlock2DConfig {
                num_layers: config.layers_per_block,
                resnet_eps: config.norm_eps,
                resnet_groups: config.norm_num_groups,
                add_downsample: i < n_blocks - 1,
                downsample_padding: config.downsample_padding,
                ..Default::default()
            };
            let down = match block.use_cross_attn {
                Some(transformer_layers_per_block) => {
                    DownBlock::CrossAttn(CrossAttnDownBlock2D::new(
                        vs_db.pp(i.to_string()),
                        in_channels,
                        block.out_channels,
                        Some(time_embed_dim),
                        use_flash_attn,
                        CrossAttnDownBlock2DConfig {
                            downblock: db_cfg,
                            attn_num_head_channels: block.attention_head_dim,
                            cross_attention_dim: config.cross_attention_dim,
                            sliced_attention_size: None,
                            use_linear_projection: config.use_linear_projection,
                            transformer_layers_per_block,
                        },
                    )?)
                }
                None => DownBlock::Basic(DownBlock2D::new(
                    vs_db.pp(i.to_string()),
                    in_channels,
                    block.out_channels,
                    Some(time_embed_dim),
                    db_cfg,
                )?),
            };
            down_blocks.push(down);
        }

        let mid_block = UNetMidBlock2DCrossAttn::new(
            vs.pp("mid_block"),
            last.out_channels,
            Some(time_embed_dim),
            use_flash_attn,
            UNetMidBlock2DCrossAttnConfig {
                resnet_eps: config.norm_eps,
                resnet_groups: Some(config.norm_num_groups),
                attn_num_head_channels: last.attention_head_dim,
                output_scale_factor: 1.,
                cross_attn_dim: config.cross_attention_dim,
                sliced_attention_size: None,
                use_linear_projection: config.use_linear_projection,
                transformer_layers_per_block: config.mid_transformer_layers,
                ..Default::default()
            },
        )?;

        // Up stages mirror the down stages, taking skip connections from the
        // matching down stage.
        let vs_ub = vs.pp("up_blocks");
        let mut up_blocks = Vec::with_capacity(n_blocks);
        for i in 0..n_blocks {
            let block = &blocks[n_blocks - 1 - i];
            let prev_out_channels = if i > 0 {
                blocks[n_blocks - i].out_channels
            } else {
                last.out_channels
            };
            let in_channels = if i == n_blocks - 1 {
                blocks[0].out_channels
            } else {
                blocks[n_blocks - i - 2].out_channels
            };
            let ub_cfg = UpBlock2DConfig {
                num_layers: config.layers_per_block + 1,
                resnet_eps: config.norm_eps,
                resnet_groups: config.norm_num_groups,
                add_upsample: i < n_blocks - 1,
                ..Default::default()
            };
            let up = match block.use_cross_attn {
                Some(transformer_layers_per_block) => {
                    UpBlock::CrossAttn(CrossAttnUpBlock2D::new(
                        vs_ub.pp(i.to_string()),
                        in_channels,
                        prev_out_channels,
                        block.out_channels,
                        Some(time_embed_dim),
                        use_flash_attn,
                        CrossAttnUpBlock2DConfig {
                            upblock: ub_cfg,
                            attn_num_head_channels: block.attention_head_dim,
                            cross_attention_dim: config.cross_attention_dim,
                            sliced_attention_size: None,
                            use_linear_projection: config.use_linear_projection,
                            transformer_layers_per_block,
                        },
                    )?)
                }
                None => UpBlock::Basic(UpBlock2D::new(
                    vs_ub.pp(i.to_string()),
                    in_channels,
                    prev_out_channels,
                    block.out_channels,
                    Some(time_embed_dim),
                    ub_cfg,
                )?),
            };
            up_blocks.push(up);
        }

        let conv_norm_out = candle_nn::group_norm(
            config.norm_num_groups,
            b_channels,
            config.norm_eps,
            vs.pp("conv_norm_out"),
        )?;
        let conv_out =
            candle_nn::conv2d(b_channels, out_channels, 3, conv_cfg, vs.pp("conv_out"))?;

        Ok(Self {
            conv_in,
            time_proj,
            time_embedding,
            down_blocks,
            mid_block,
            up_blocks,
            conv_norm_out,
            conv_out,
        })
    }

    pub fn mid_transformer_layers(&self) -> usize {
        self.mid_block.config.transformer_layers_per_block
    }

    pub fn forward(
        &self,
        xs: &Tensor,
        timestep: f64,
        encoder_hidden_states: &Tensor,
    ) -> Result<Tensor> {
        let (bsize, _, height, width) = xs.dims4()?;
        let n_blocks = self.down_blocks.len();
        let up_factor = 2usize.pow(n_blocks as u32 - 1);
        let forward_upsample_size = height % up_factor != 0 || width % up_factor != 0;

        let emb = (Tensor::ones(bsize, xs.dtype(), xs.device())? * timestep)?;
        let emb = self.time_proj.forward(&emb)?;
        let emb = self.time_embedding.forward(&emb)?;

        let mut xs = self.conv_in.forward(xs)?;
        let mut res_stack = vec![xs.clone()];
        for down_block in &self.down_blocks {
            let (next, res) = match down_block {
                DownBlock::Basic(b) => b.forward(&xs, Some(&emb))?,
                DownBlock::CrossAttn(b) => {
                    b.forward(&xs, Some(&emb), Some(encoder_hidden_states))?
                }
            };
            res_stack.extend(res);
            xs = next;
        }

        xs = self
            .mid_block
            .forward(&xs, Some(&emb), Some(encoder_hidden_states))?;

        let mut upsample_size = None;
        for (i, up_block) in self.up_blocks.iter().enumerate() {
            let Some(split) = res_stack.len().checked_sub(up_block.resnets()) else {
                candle_core::bail!("refiner unet ran out of skip connections at up block {i}");
            };
            let res = res_stack.split_off(split);
            if i < n_blocks - 1 && forward_upsample_size {
                if let Some(skip) = res_stack.last() {
                    let (_, _, h, w) = skip.dims4()?;
                    upsample_size = Some((h, w));
                }
            }
            xs = match up_block {
                UpBlock::Basic(b) => b.forward(&xs, &res, Some(&emb), upsample_size)?,
                UpBlock::CrossAttn(b) => b.forward(
                    &xs,
                    &res,
                    Some(&emb),
                    upsample_size,
                    Some(encoder_hidden_states),
                )?,
            };
        }

        let xs = self.conv_norm_out.forward(&xs)?;
        let xs = candle_nn::ops::silu(&xs)?;
        self.conv_out.forward(&xs)
    }
}
